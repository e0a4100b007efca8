//! Duplicate-sensor filtering. Many boards expose the same junction through
//! several chips; within a tolerance-grouped cluster only the
//! highest-priority sensor stays visible. Hidden sensors remain addressable
//! by id and can be re-shown from the UI.

use pankha_protocol::chips::{chip_priority, derive_chip_name};
use pankha_protocol::types::Sensor;

/// Mark duplicates invisible in place. Sensors whose readings sit within
/// `tolerance` °C of each other form a group; the highest chip priority in
/// the group stays visible, ties broken by sensor-id order.
pub fn apply_duplicate_filter(sensors: &mut [Sensor], tolerance: f64) {
    for sensor in sensors.iter_mut() {
        sensor.visible = true;
    }

    let mut order: Vec<usize> = (0..sensors.len()).collect();
    order.sort_by(|&a, &b| {
        sensors[a]
            .temperature
            .partial_cmp(&sensors[b].temperature)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    // Chain temperatures into clusters: a gap larger than the tolerance
    // starts a new group.
    let mut group: Vec<usize> = Vec::new();
    let mut last_temp = f64::NEG_INFINITY;
    for &idx in &order {
        let temp = sensors[idx].temperature;
        if !group.is_empty() && (temp - last_temp) > tolerance {
            hide_all_but_best(sensors, &group);
            group.clear();
        }
        group.push(idx);
        last_temp = temp;
    }
    hide_all_but_best(sensors, &group);
}

fn hide_all_but_best(sensors: &mut [Sensor], group: &[usize]) {
    if group.len() < 2 {
        return;
    }
    let best = *group
        .iter()
        .max_by(|&&a, &&b| {
            let pa = sensor_priority(&sensors[a]);
            let pb = sensor_priority(&sensors[b]);
            // Deterministic tie-break: higher priority wins, then the
            // lexicographically smaller id.
            pa.cmp(&pb)
                .then_with(|| sensors[b].id.cmp(&sensors[a].id))
        })
        .unwrap();
    for &idx in group {
        if idx != best {
            sensors[idx].visible = false;
        }
    }
}

fn sensor_priority(sensor: &Sensor) -> i32 {
    let chip = sensor
        .chip
        .as_deref()
        .unwrap_or_else(|| derive_chip_name(&sensor.id));
    chip_priority(chip)
}
