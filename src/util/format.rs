// Round `n` to 3 decimal places, used for the fairshare and CPU-allocation fractions in the
// cluster health snapshot.
pub fn three_places(n: f64) -> f64 {
    (n * 1000.0).round() / 1000.0
}

#[test]
fn three_places_rounds() {
    assert_eq!(three_places(1.0 / 3.0), 0.333);
    assert_eq!(three_places(2.0 / 3.0), 0.667);
}
