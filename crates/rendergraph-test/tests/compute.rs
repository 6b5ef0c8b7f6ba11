//! End-to-end compute dispatches through the bundled shaders.

use approx::assert_relative_eq;
use rendergraph_test::{copy_round_trip, merge_round_trip, try_headless};
use serial_test::serial;

#[test]
#[serial]
fn hundred_floats_survive_a_compute_copy() {
    let Some(harness) = try_headless() else { return };
    let input: Vec<f32> = (0..100u8).map(|i| f32::from(i) * 0.5).collect();

    let output = copy_round_trip(&harness, &input).unwrap();

    assert_eq!(output.len(), input.len());
    for (expected, actual) in input.iter().zip(&output) {
        assert_relative_eq!(*expected, *actual);
    }
    assert_eq!(harness.ctx.allocator().live_allocations(), 0);
}

#[test]
#[serial]
fn three_binding_merge_reads_back_sequence_exactly() {
    let Some(harness) = try_headless() else { return };
    let input: Vec<f32> = (0..100u8).map(f32::from).collect();

    let output = merge_round_trip(&harness, &input, &input).unwrap();

    assert_eq!(output.len(), 100);
    for (index, (expected, actual)) in input.iter().zip(&output).enumerate() {
        assert_eq!(expected.to_bits(), actual.to_bits(), "element {index}");
    }
    assert_eq!(harness.ctx.allocator().live_allocations(), 0);
}
