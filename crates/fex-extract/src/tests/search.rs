//! Critical-point locator tests.

use super::{random_probes, victim_2x3x2};
use crate::config::{ExtractionConfig, SkipReason};
use crate::search::{search_line, ProbeLine};
use fex_core::ReluNetwork;
use ndarray::{arr1, arr2};

fn axis_line() -> ProbeLine {
    ProbeLine {
        probe_index: 0,
        direction_index: 0,
        origin: arr1(&[0.0, 0.0]),
        direction: arr1(&[1.0, 0.0]),
    }
}

#[test]
fn test_search_finds_every_crossing_on_axis_line() {
    let victim = victim_2x3x2();
    let config = ExtractionConfig::default();

    // Along x(t) = (t, 0) the three units cross at t = -0.25, t = -2/3 and
    // t = -0.375 respectively.
    let result = search_line(&victim, &axis_line(), &config).unwrap();
    assert_eq!(result.points.len(), 3);

    let mut ts: Vec<f64> = result.points.iter().map(|p| p.t).collect();
    ts.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let expected = [-2.0 / 3.0, -0.375, -0.25];
    for (t, want) in ts.iter().zip(expected.iter()) {
        assert!(
            (t - want).abs() < 2.0 * config.t_tol,
            "crossing at {} not located (got {})",
            want,
            t
        );
    }
}

#[test]
fn test_located_points_sit_on_a_unit_boundary() {
    let victim = victim_2x3x2();
    let config = ExtractionConfig::default();
    let result = search_line(&victim, &axis_line(), &config).unwrap();

    for point in &result.points {
        let z = victim.preactivations(point.location.view());
        let min_abs = z.iter().fold(f64::INFINITY, |acc, v| acc.min(v.abs()));
        assert!(
            min_abs < 1e-5,
            "reported critical point has no vanishing pre-activation (min |z| = {:.3e})",
            min_abs
        );
    }
}

#[test]
fn test_jump_direction_matches_weight_row() {
    let victim = victim_2x3x2();
    let config = ExtractionConfig::default();
    let result = search_line(&victim, &axis_line(), &config).unwrap();

    for point in &result.points {
        // The nearest-to-zero pre-activation identifies the crossing unit.
        let z = victim.preactivations(point.location.view());
        let unit = z
            .iter()
            .enumerate()
            .min_by(|a, b| a.1.abs().partial_cmp(&b.1.abs()).unwrap())
            .map(|(i, _)| i)
            .unwrap();
        let row = victim.w0().row(unit);
        let row_norm = row.dot(&row).sqrt();
        let cos = point.jump_direction.dot(&row) / row_norm;
        assert!(
            cos.abs() > 1.0 - 1e-9,
            "jump direction not parallel to the crossing unit's weight row (|cos| = {})",
            cos.abs()
        );
    }
}

#[test]
fn test_measured_jump_reproduces_at_the_point() {
    let victim = victim_2x3x2();
    let config = ExtractionConfig::default();
    let result = search_line(&victim, &axis_line(), &config).unwrap();
    assert!(!result.points.is_empty());

    let line = axis_line();
    let eps = 1e-4;
    for point in &result.points {
        let above = victim.jacobian(line.point_at(point.t + eps).view());
        let below = victim.jacobian(line.point_at(point.t - eps).view());
        let measured = above - below;
        for (i, row) in measured.outer_iter().enumerate() {
            for (j, &v) in row.iter().enumerate() {
                let predicted = point.jump_coefficients[i] * point.jump_direction[j];
                assert!(
                    (v - predicted).abs() < 1e-9,
                    "recorded jump does not match the Jacobian difference at the point"
                );
            }
        }
    }
}

#[test]
fn test_line_missing_every_boundary_reports_no_crossing() {
    // Single unit whose boundary x_0 = 50 lies far outside the search range.
    let victim = ReluNetwork::new(
        arr2(&[[1.0, 0.0]]),
        arr1(&[-50.0]),
        arr2(&[[1.0]]),
        arr1(&[0.0]),
    )
    .unwrap();
    let config = ExtractionConfig::default();
    let result = search_line(&victim, &axis_line(), &config).unwrap();

    assert!(result.points.is_empty());
    assert_eq!(result.skips.len(), 1);
    assert_eq!(result.skips[0].reason, SkipReason::NoCrossing);
}

#[test]
fn test_coincident_crossings_are_discarded_as_ambiguous() {
    // Two units whose boundaries both pass through the origin with
    // independent directions; a line through the origin crosses both at
    // t = 0 simultaneously, so the jump there is rank two.
    let victim = ReluNetwork::new(
        arr2(&[[1.0, 0.0], [0.0, 1.0]]),
        arr1(&[0.0, 0.0]),
        arr2(&[[1.0, 0.0], [0.0, 1.0]]),
        arr1(&[0.0, 0.0]),
    )
    .unwrap();
    let config = ExtractionConfig::default();
    let sq = std::f64::consts::FRAC_1_SQRT_2;
    let line = ProbeLine {
        probe_index: 0,
        direction_index: 0,
        origin: arr1(&[0.0, 0.0]),
        direction: arr1(&[sq, sq]),
    };

    let result = search_line(&victim, &line, &config).unwrap();
    assert!(result.points.is_empty());
    assert!(result
        .skips
        .iter()
        .any(|s| matches!(s.reason, SkipReason::AmbiguousDiscontinuity { t } if t.abs() < 1e-3)));
}

#[test]
fn test_bisection_cap_reports_inconclusive() {
    let victim = victim_2x3x2();
    let config = ExtractionConfig {
        max_bisection_iters: 1,
        ..ExtractionConfig::default()
    };
    let result = search_line(&victim, &axis_line(), &config).unwrap();

    assert!(result.points.is_empty());
    assert!(result
        .skips
        .iter()
        .all(|s| matches!(s.reason, SkipReason::Inconclusive { .. })));
    assert!(!result.skips.is_empty());
}

#[test]
fn test_huge_jump_tolerance_sees_nothing() {
    // Tolerance-regime check: a discontinuity threshold far above any real
    // jump magnitude turns every line into a no-crossing report.
    let victim = victim_2x3x2();
    let config = ExtractionConfig {
        jump_tol: 1e9,
        ..ExtractionConfig::default()
    };
    let result = search_line(&victim, &axis_line(), &config).unwrap();
    assert!(result.points.is_empty());
    assert_eq!(result.skips[0].reason, SkipReason::NoCrossing);
}

#[test]
fn test_search_is_deterministic() {
    let victim = victim_2x3x2();
    let config = ExtractionConfig::default();
    let probes = random_probes(1, 2, 3, 1.0);
    let line = ProbeLine {
        probe_index: 0,
        direction_index: 0,
        origin: probes.row(0).to_owned(),
        direction: arr1(&[0.6, 0.8]),
    };

    let a = search_line(&victim, &line, &config).unwrap();
    let b = search_line(&victim, &line, &config).unwrap();
    assert_eq!(a.points.len(), b.points.len());
    for (pa, pb) in a.points.iter().zip(&b.points) {
        assert_eq!(pa.t, pb.t);
        assert_eq!(pa.location, pb.location);
        assert_eq!(pa.jump_direction, pb.jump_direction);
        assert_eq!(pa.jump_coefficients, pb.jump_coefficients);
    }
}
