use crate::generator::profile::SurveyProfile;
use anyhow::bail;

pub const SCENARIOS: &[&str] = &["adjacent-blocks", "disjoint", "three-way"];

/// Canned survey layouts for offline runs.
pub fn scenario(name: &str) -> anyhow::Result<Vec<SurveyProfile>> {
    let base = SurveyProfile::default();
    let profiles = match name {
        // Older block in the working projection, newer block flown on a local
        // grid with a +50 nT bias and a 300 m overlap.
        "adjacent-blocks" => vec![
            SurveyProfile {
                name: "north-2019".into(),
                seed: 1,
                ..base.clone()
            },
            SurveyProfile {
                name: "south-2023".into(),
                projection: "LOCAL:SOUTH".into(),
                grid_shift_x: 25_000.0,
                grid_shift_y: 8_000.0,
                origin_y: 600.0,
                level_offset: 50.0,
                acquisition_start: 4.0e6,
                seed: 2,
                first_flight: 11,
                ..base
            },
        ],
        "disjoint" => vec![
            SurveyProfile {
                name: "east".into(),
                ..base.clone()
            },
            SurveyProfile {
                name: "west".into(),
                origin_x: -40_000.0,
                level_offset: -12.0,
                ..base
            },
        ],
        "three-way" => vec![
            SurveyProfile {
                name: "block-a".into(),
                line_count: 8,
                ..base.clone()
            },
            SurveyProfile {
                name: "block-b".into(),
                line_count: 8,
                origin_y: 500.0,
                level_offset: 35.0,
                instrument: "overhauser".into(),
                precision: 0.02,
                acquisition_start: 1.0e6,
                ..base.clone()
            },
            SurveyProfile {
                name: "block-c".into(),
                line_count: 8,
                origin_y: 1_000.0,
                level_offset: -20.0,
                acquisition_start: 2.0e6,
                ..base
            },
        ],
        other => bail!(
            "unknown scenario '{}' (expected one of: {})",
            other,
            SCENARIOS.join(", ")
        ),
    };
    Ok(profiles)
}
