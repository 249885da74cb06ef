// Encrypt, multiply and decrypt a large batch under each hybrid mode and
// report how the modexp work was split between software and the accelerator.
//
// Run with: cargo run --release --example hybrid_offload

use std::{sync::Arc, time::Duration, time::Instant};

use log::info;
use num_bigint::BigUint;
use paillier_hybrid::{
    EmulatedAccelerator, EmulatorConfig, HybridConfig, HybridMode, KeyPair, OffloadConfig,
    OffloadContext, PlainText,
};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;

const KEY_BITS: u64 = 1024;
const BATCH: usize = 512;

fn main() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .try_init();

    let mut rng = ChaCha20Rng::seed_from_u64(42);
    let pair = KeyPair::generate_with_rng(&mut rng, KEY_BITS, true).expect("key generation");
    let plain = PlainText::new(
        (0..BATCH)
            .map(|_| BigUint::from(rng.random::<u64>()))
            .collect(),
    );
    let scale = PlainText::new(vec![BigUint::from(3u32)]);

    for mode in [
        HybridMode::Off,
        HybridMode::Optimal,
        HybridMode::Fixed(50),
        HybridMode::Fixed(100),
    ] {
        let device = Arc::new(EmulatedAccelerator::new(EmulatorConfig {
            latency: Duration::from_micros(50),
            ..EmulatorConfig::default()
        }));
        let config =
            OffloadConfig::default().with_hybrid(HybridConfig::default().with_mode(mode));
        let ctx = OffloadContext::initialize(config, device.clone()).expect("offload context");

        let start = Instant::now();
        let cipher = pair
            .public_key
            .encrypt_with(&plain, true, &mut rng, &ctx)
            .expect("encrypt");
        let tripled = cipher.mul_plain_with(&scale, &ctx).expect("multiply");
        let decrypted = pair
            .private_key
            .decrypt_with(&tripled, &ctx)
            .expect("decrypt");
        let elapsed = start.elapsed();

        let n = pair.public_key.n();
        let ok = decrypted
            .values()
            .iter()
            .zip(plain.values())
            .all(|(d, p)| *d == p * 3u32 % n);
        assert!(ok, "homomorphic result mismatch under {mode}");

        let stats = ctx.stats();
        info!(
            "{mode:>10}: {elapsed:?} | hw {} sw {} fallback {} | batches {} ({} flushed by deadline)",
            stats.hardware_jobs,
            stats.software_jobs,
            stats.fallback_jobs,
            stats.batches_submitted,
            stats.timeout_flushes,
        );
        ctx.terminate();
    }
}
