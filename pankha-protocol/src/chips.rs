//! Chip identity rules: group-name derivation from sensor ids, sensor
//! classification, and the priority table used for duplicate filtering.
//!
//! The hub stores fan→chip-group assignments made in the UI; the agent
//! resolves them against live sensors. Both sides derive group names with
//! this exact cascade so a selection survives the round trip.

/// Derive the chip-group name from a sensor id.
///
/// Cascade:
/// 1. longest prefix shaped `<alnum>+_<digits>+` (e.g. `nvidiagpu_0_core` → `nvidiagpu_0`)
/// 2. the prefix before the first underscore (e.g. `k10temp_tctl` → `k10temp`)
/// 3. the whole id
pub fn derive_chip_name(sensor_id: &str) -> &str {
    if let Some(prefix) = indexed_chip_prefix(sensor_id) {
        return prefix;
    }
    match sensor_id.split_once('_') {
        Some((head, _)) if !head.is_empty() => head,
        _ => sensor_id,
    }
}

/// Match `<alnum>+_<digits>+` at the start of the id, ending at an
/// underscore or the end of the string.
fn indexed_chip_prefix(id: &str) -> Option<&str> {
    let bytes = id.as_bytes();
    let alnum_end = bytes.iter().position(|b| !b.is_ascii_alphanumeric())?;
    if alnum_end == 0 || bytes.get(alnum_end) != Some(&b'_') {
        return None;
    }
    let digits_start = alnum_end + 1;
    let digit_len = bytes[digits_start..]
        .iter()
        .take_while(|b| b.is_ascii_digit())
        .count();
    if digit_len == 0 {
        return None;
    }
    let end = digits_start + digit_len;
    match bytes.get(end) {
        None | Some(&b'_') => Some(&id[..end]),
        _ => None,
    }
}

/// Duplicate-filter priority for a chip name. Higher wins within a
/// duplicate group.
pub fn chip_priority(chip: &str) -> i32 {
    let chip = chip.to_lowercase();
    if chip.contains("k10temp") || chip.contains("coretemp") || chip.contains("cpu") {
        100
    } else if chip.contains("nvidia") || chip.contains("amdgpu") || chip.contains("radeon") {
        90
    } else if chip.contains("it8") || chip.contains("nct") {
        85
    } else if chip.contains("nvme") {
        75
    } else if chip.contains("wmi") {
        50
    } else if chip.contains("acpi") {
        40
    } else {
        30
    }
}

/// Classify a chip into the sensor type tag carried on the wire.
pub fn classify_sensor_type(chip_name: &str) -> &'static str {
    let chip_lower = chip_name.to_lowercase();
    if chip_lower.contains("k10temp") || chip_lower.contains("coretemp") || chip_lower.contains("cpu")
    {
        "cpu"
    } else if chip_lower.contains("nvidia") || chip_lower.contains("amdgpu") || chip_lower.contains("radeon")
    {
        "gpu"
    } else if chip_lower.contains("nvme") {
        "nvme"
    } else if chip_lower.contains("it8") || chip_lower.contains("nct") {
        "motherboard"
    } else if chip_lower.contains("acpi") {
        "acpi"
    } else {
        "other"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derives_indexed_gpu_group() {
        assert_eq!(derive_chip_name("nvidiagpu_0"), "nvidiagpu_0");
        assert_eq!(derive_chip_name("nvidiagpu_0_core"), "nvidiagpu_0");
        assert_eq!(derive_chip_name("nvidiagpu_12_hotspot"), "nvidiagpu_12");
    }

    #[test]
    fn falls_back_to_first_segment() {
        assert_eq!(derive_chip_name("k10temp_tctl"), "k10temp");
        assert_eq!(derive_chip_name("it8628_temp_sys"), "it8628");
    }

    #[test]
    fn whole_id_when_no_underscore() {
        assert_eq!(derive_chip_name("coretemp"), "coretemp");
        assert_eq!(derive_chip_name(""), "");
    }

    #[test]
    fn derivation_is_idempotent() {
        for id in ["nvidiagpu_0_core", "k10temp_tctl", "nct6799_fan_2", "acpitz"] {
            let once = derive_chip_name(id);
            assert_eq!(derive_chip_name(once), once);
        }
    }

    #[test]
    fn priority_ordering_matches_dedup_rules() {
        assert!(chip_priority("k10temp") > chip_priority("nvidiagpu_0"));
        assert!(chip_priority("nvidiagpu_0") > chip_priority("it8628"));
        assert!(chip_priority("it8628") > chip_priority("nvme"));
        assert!(chip_priority("nvme") > chip_priority("wmi"));
        assert!(chip_priority("wmi") > chip_priority("acpitz"));
    }

    #[test]
    fn classifies_chip_types() {
        assert_eq!(classify_sensor_type("k10temp"), "cpu");
        assert_eq!(classify_sensor_type("nvme"), "nvme");
        assert_eq!(classify_sensor_type("it8628"), "motherboard");
        assert_eq!(classify_sensor_type("amdgpu"), "gpu");
        assert_eq!(classify_sensor_type("mystery"), "other");
    }
}
