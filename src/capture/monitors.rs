//! Monitor enumeration: merging two OS sources into one stable list.
//!
//! The device-oriented and monitor-oriented enumerations disagree in edge
//! cases (mirrored sets, stale entries during a mode switch), so both are
//! queried and merged. Two entries describe the same monitor iff the
//! device names match case-insensitively or the top-left position and size
//! match within a 2-pixel tolerance.

use serde::{Deserialize, Serialize};

use crate::platform::DisplayDevice;

/// Position/size tolerance for treating two entries as the same monitor.
const MATCH_TOLERANCE: i32 = 2;

/// One monitor as exposed on the control plane.
///
/// `id` is `DISPLAY<n>` where `n` reflects the sorted order
/// (primary first, then ascending x, then ascending y), reassigned on
/// every enumeration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorInfo {
    pub id: String,
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub x: i32,
    pub y: i32,
    pub primary: bool,
}

impl MonitorInfo {
    /// Pixel center in virtual-desktop coordinates.
    pub fn center(&self) -> (i32, i32) {
        (
            self.x + self.width as i32 / 2,
            self.y + self.height as i32 / 2,
        )
    }
}

fn same_monitor(a: &DisplayDevice, b: &DisplayDevice) -> bool {
    if a.device_name.eq_ignore_ascii_case(&b.device_name) {
        return true;
    }
    (a.x - b.x).abs() <= MATCH_TOLERANCE
        && (a.y - b.y).abs() <= MATCH_TOLERANCE
        && (a.width as i32 - b.width as i32).abs() <= MATCH_TOLERANCE
        && (a.height as i32 - b.height as i32).abs() <= MATCH_TOLERANCE
}

/// Merge both enumeration sources, de-duplicate, sort, and assign ids.
pub fn merge_sources(
    devices: Vec<DisplayDevice>,
    monitors: Vec<DisplayDevice>,
) -> Vec<MonitorInfo> {
    let mut merged: Vec<DisplayDevice> = devices;

    for candidate in monitors {
        if !merged.iter().any(|known| same_monitor(known, &candidate)) {
            merged.push(candidate);
        }
    }

    merged.sort_by(|a, b| {
        b.primary
            .cmp(&a.primary)
            .then(a.x.cmp(&b.x))
            .then(a.y.cmp(&b.y))
    });

    merged
        .into_iter()
        .enumerate()
        .map(|(index, device)| MonitorInfo {
            id: format!("DISPLAY{}", index + 1),
            name: if device.friendly_name.is_empty() {
                device.device_name.clone()
            } else {
                device.friendly_name.clone()
            },
            width: device.width,
            height: device.height,
            x: device.x,
            y: device.y,
            primary: device.primary,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(name: &str, x: i32, y: i32, width: u32, height: u32, primary: bool) -> DisplayDevice {
        DisplayDevice {
            device_name: name.to_string(),
            friendly_name: format!("{} panel", name),
            x,
            y,
            width,
            height,
            primary,
        }
    }

    #[test]
    fn duplicate_names_collapse_case_insensitively() {
        let merged = merge_sources(
            vec![device(r"\\.\DISPLAY1", 0, 0, 1920, 1080, true)],
            vec![device(r"\\.\display1", 500, 500, 800, 600, false)],
        );
        assert_eq!(merged.len(), 1);
    }

    #[test]
    fn near_identical_geometry_collapses() {
        let merged = merge_sources(
            vec![device("A", 0, 0, 1920, 1080, true)],
            vec![device("B", 1, 2, 1921, 1079, false)],
        );
        assert_eq!(merged.len(), 1);
    }

    #[test]
    fn distinct_monitors_survive_the_merge() {
        let merged = merge_sources(
            vec![device("A", 0, 0, 1920, 1080, true)],
            vec![
                device("A", 0, 0, 1920, 1080, true),
                device("B", 1920, 0, 1920, 1080, false),
            ],
        );
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn sort_is_primary_first_then_x_then_y() {
        let merged = merge_sources(
            vec![
                device("right", 1920, 0, 1920, 1080, false),
                device("stacked", 1920, 1080, 1920, 1080, false),
                device("main", 0, 0, 1920, 1080, true),
            ],
            vec![],
        );

        assert_eq!(merged[0].name, "main panel");
        assert_eq!(merged[1].name, "right panel");
        assert_eq!(merged[2].name, "stacked panel");
    }

    #[test]
    fn ids_reflect_sorted_order() {
        let merged = merge_sources(
            vec![
                device("right", 2560, 0, 2560, 1440, false),
                device("main", 0, 0, 2560, 1440, true),
            ],
            vec![],
        );
        assert_eq!(merged[0].id, "DISPLAY1");
        assert!(merged[0].primary);
        assert_eq!(merged[1].id, "DISPLAY2");
    }

    #[test]
    fn center_is_the_pixel_midpoint() {
        let merged = merge_sources(vec![device("m", 100, 50, 800, 600, true)], vec![]);
        assert_eq!(merged[0].center(), (500, 350));
    }
}
