// Process-wide context lifecycle driven through the flat session API.
// Every test touches global state, so they run serially.

use std::sync::Arc;

use paillier_hybrid::{
    ContextError, EmulatedAccelerator, EmulatorConfig, HybridMode, OffloadConfig, Session,
    initialize_context, is_context_active, runtime, set_hybrid_mode, set_hybrid_off,
    terminate_context,
};
use serial_test::serial;

fn small_config() -> OffloadConfig {
    OffloadConfig::default()
        .with_instances(2)
        .with_buffers(4, 16)
        .with_pinning(false)
}

#[test_log::test]
#[serial]
fn session_flow_under_optimal_hybrid_mode() {
    terminate_context();
    initialize_context("QAT").unwrap();
    set_hybrid_mode(HybridMode::Optimal);
    assert_eq!(runtime::hybrid_mode(), HybridMode::Optimal);

    let mut session = Session::new();
    let key = session.keypair_create(256, true).unwrap();
    assert_eq!(session.public_key_words(key).unwrap().len(), 8);

    let words: Vec<u32> = (0..300).collect();
    let doubled: Vec<u32> = words.iter().map(|w| w * 2).collect();
    let pt = session.plaintext_create(&words);
    let twos = session.plaintext_create(&[2]);

    let ct = session.encrypt(key, pt).unwrap();
    let product = session.multiply(ct, twos).unwrap();
    let out = session.decrypt(key, product).unwrap();
    assert_eq!(session.plaintext_export(out).unwrap(), doubled);

    let sum = session.add(ct, ct).unwrap();
    let out = session.decrypt(key, sum).unwrap();
    assert_eq!(session.plaintext_export(out).unwrap(), doubled);

    let stats = runtime::current().unwrap().stats();
    assert!(stats.hardware_jobs + stats.fallback_jobs > 0);

    set_hybrid_off();
    terminate_context();
    assert!(!is_context_active());
}

#[test_log::test]
#[serial]
fn operations_survive_terminate() {
    terminate_context();
    set_hybrid_mode(HybridMode::Fixed(100));
    let device = Arc::new(EmulatedAccelerator::default());
    runtime::initialize_context_with(small_config(), device.clone()).unwrap();

    let mut session = Session::new();
    let key = session.keypair_create(256, false).unwrap();
    let pt = session.plaintext_create(&[5, 6, 7]);
    let ct = session.encrypt(key, pt).unwrap();
    assert!(device.jobs_completed() >= 3);

    terminate_context();
    terminate_context();
    assert!(!device.is_running());

    let out = session.decrypt(key, ct).unwrap();
    assert_eq!(session.plaintext_export(out).unwrap(), vec![5, 6, 7]);
    set_hybrid_off();
}

#[test_log::test]
#[serial]
fn startup_failure_leaves_runtime_inactive() {
    terminate_context();
    let device = Arc::new(EmulatedAccelerator::new(EmulatorConfig {
        instances: 0,
        ..EmulatorConfig::default()
    }));
    assert!(matches!(
        runtime::initialize_context_with(small_config(), device.clone()),
        Err(ContextError::NoInstances)
    ));
    assert!(!is_context_active());
    assert!(!device.is_running());

    assert!(matches!(
        initialize_context("fpga"),
        Err(ContextError::UnknownSelector(_))
    ));
    initialize_context("IPP").unwrap();
    assert!(!is_context_active());
}
