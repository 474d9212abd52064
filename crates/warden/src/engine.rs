//! Authorization engine
//!
//! Pure decision function from a device event and an allow-list snapshot to
//! [`Decision`]. Anything that prevents a full identity from being read
//! resolves to a denial.

use crate::policy::AllowList;
use common::{Decision, DenyReason, DeviceEvent};
use serde::{Deserialize, Serialize};

/// Interpretation of vendor/product id strings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IdFormat {
    /// Digit-by-digit decimal accumulation without validating the characters.
    /// sysfs exposes hexadecimal ids, so `046d` reads as 512 here; allow-list
    /// entries must be written with the same arithmetic.
    #[default]
    LegacyDecimal,
    /// Hexadecimal ids, optional `0x` prefix
    Hex,
}

impl IdFormat {
    /// Interpret an id attribute read from the device
    ///
    /// `LegacyDecimal` never fails; `Hex` fails on anything that is not a
    /// hexadecimal number.
    pub fn parse_attribute(&self, raw: &str) -> Option<u32> {
        match self {
            IdFormat::LegacyDecimal => Some(accumulate_decimal(raw)),
            IdFormat::Hex => parse_hex(raw),
        }
    }

    /// Interpret an id field of an allow-list record
    pub fn parse_policy_field(&self, field: &str) -> Option<u32> {
        match self {
            IdFormat::LegacyDecimal => field.parse().ok(),
            IdFormat::Hex => parse_hex(field),
        }
    }
}

fn accumulate_decimal(raw: &str) -> u32 {
    raw.bytes().fold(0u32, |acc, b| {
        acc.wrapping_mul(10)
            .wrapping_add(u32::from(b).wrapping_sub(u32::from(b'0')))
    })
}

fn parse_hex(raw: &str) -> Option<u32> {
    let digits = raw
        .strip_prefix("0x")
        .or_else(|| raw.strip_prefix("0X"))
        .unwrap_or(raw);
    if digits.is_empty() {
        return None;
    }
    u32::from_str_radix(digits, 16).ok()
}

/// Decide whether a device may stay connected
pub fn decide(event: &DeviceEvent, policy: &AllowList) -> Decision {
    let (Some(vendor), Some(product), Some(serial)) = (
        event.vendor_id.as_deref(),
        event.product_id.as_deref(),
        event.serial.as_deref(),
    ) else {
        return Decision::Deny(DenyReason::IncompleteIdentity);
    };

    let format = policy.id_format();
    let (Some(vendor_id), Some(product_id)) = (
        format.parse_attribute(vendor),
        format.parse_attribute(product),
    ) else {
        return Decision::Deny(DenyReason::IncompleteIdentity);
    };

    match policy.find_match(serial, vendor_id, product_id) {
        Some(_) => Decision::Allow,
        None => Decision::Deny(DenyReason::NotInAllowList),
    }
}


/// Property-based tests using proptest
#[cfg(test)]
mod proptests {
    use super::*;
    use common::{AllowListEntry, DeviceAction};
    use proptest::prelude::*;

    fn serial_strategy() -> impl Strategy<Value = String> {
        "[A-Z0-9]{1,12}"
    }

    fn entry_strategy() -> impl Strategy<Value = AllowListEntry> {
        (serial_strategy(), 0u32..10_000, 0u32..10_000)
            .prop_map(|(serial, vid, pid)| AllowListEntry::new(serial, vid, pid))
    }

    fn event_for(vid: u32, pid: u32, serial: &str) -> DeviceEvent {
        DeviceEvent::new(DeviceAction::Attached, "/devices/usb1/1-1")
            .with_devnode("/dev/bus/usb/001/002")
            .with_identity(vid.to_string(), pid.to_string(), serial)
    }

    proptest! {
        /// Property: every listed identity is allowed, with any serial suffix
        #[test]
        fn prop_listed_identity_allowed(
            entries in proptest::collection::vec(entry_strategy(), 1..16),
            pick in any::<prop::sample::Index>(),
            suffix in "[a-z]{0,4}",
        ) {
            let chosen = pick.get(&entries).clone();
            let policy = AllowList::from_entries(entries, IdFormat::LegacyDecimal);
            let serial = format!("{}{}", chosen.serial, suffix);
            let ev = event_for(chosen.vendor_id, chosen.product_id, &serial);
            prop_assert_eq!(decide(&ev, &policy), Decision::Allow);
        }

        /// Property: an identity with no matching entry is denied
        #[test]
        fn prop_unlisted_identity_denied(
            entries in proptest::collection::vec(entry_strategy(), 0..16),
            vid in 10_000u32..20_000,
            pid in 0u32..10_000,
            serial in serial_strategy(),
        ) {
            let policy = AllowList::from_entries(entries, IdFormat::LegacyDecimal);
            let ev = event_for(vid, pid, &serial);
            prop_assert_eq!(decide(&ev, &policy), Decision::Deny(DenyReason::NotInAllowList));
        }

        /// Property: a missing identity attribute is denied whatever the policy holds
        #[test]
        fn prop_incomplete_identity_denied(
            entries in proptest::collection::vec(entry_strategy(), 0..16),
            missing in 0usize..3,
            vid in 0u32..10_000,
            pid in 0u32..10_000,
            serial in serial_strategy(),
        ) {
            let mut all = entries;
            all.push(AllowListEntry::new(serial.clone(), vid, pid));
            let policy = AllowList::from_entries(all, IdFormat::LegacyDecimal);

            let mut ev = event_for(vid, pid, &serial);
            match missing {
                0 => ev.vendor_id = None,
                1 => ev.product_id = None,
                _ => ev.serial = None,
            }
            prop_assert_eq!(decide(&ev, &policy), Decision::Deny(DenyReason::IncompleteIdentity));
        }

        /// Property: the indexed lookup agrees with a linear first-match scan
        #[test]
        fn prop_index_matches_linear_scan(
            entries in proptest::collection::vec(entry_strategy(), 0..24),
            vid in 0u32..10_000,
            pid in 0u32..10_000,
            serial in serial_strategy(),
        ) {
            let linear = entries.iter().any(|e| e.matches(&serial, vid, pid));
            let policy = AllowList::from_entries(entries, IdFormat::LegacyDecimal);
            let ev = event_for(vid, pid, &serial);
            prop_assert_eq!(decide(&ev, &policy).is_allowed(), linear);
        }
    }
}
