//! Shared setup for the integration tests

#![allow(dead_code)]

use std::sync::Arc;

use render_core::backend::{HeadlessConfig, HeadlessDevice};
use render_core::foundation::logging;
use render_core::{CoreConfig, GraphicsContext};

/// Headless device plus a context with `frames_in_flight` frames
pub fn context_with_frames(frames_in_flight: u32) -> (Arc<HeadlessDevice>, Arc<GraphicsContext>) {
    context_with(HeadlessConfig::default(), frames_in_flight)
}

/// Headless device of a custom shape plus a context
pub fn context_with(
    config: HeadlessConfig,
    frames_in_flight: u32,
) -> (Arc<HeadlessDevice>, Arc<GraphicsContext>) {
    logging::init_for_tests();
    let device = Arc::new(HeadlessDevice::with_config(config));
    let config = CoreConfig::default().with_frames_in_flight(frames_in_flight);
    let context = GraphicsContext::new(device.clone(), config).expect("headless context");
    (device, context)
}

/// Deterministic test payload
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 + 3) as u8).collect()
}

/// Fail the test if the simulated GPU saw a contract violation
pub fn assert_clean(device: &HeadlessDevice) {
    let errors = device.validation_errors();
    assert!(errors.is_empty(), "validation errors: {errors:?}");
}
