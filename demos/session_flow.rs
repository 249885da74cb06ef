// The flat handle-based API, as used from foreign callers: select the
// backend, create objects, operate on handles, export results, clean up.
//
// Run with: cargo run --example session_flow

use log::info;
use paillier_hybrid::{
    HybridMode, Session, initialize_context, runtime, set_hybrid_mode, terminate_context,
};

fn main() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .try_init();

    let selector = std::env::args().nth(1).unwrap_or_else(|| "QAT".to_string());
    initialize_context(&selector).expect("initialize context");
    set_hybrid_mode(HybridMode::Optimal);
    info!(
        "backend {selector}, hybrid mode {}, accelerator active: {}",
        runtime::hybrid_mode(),
        runtime::is_context_active()
    );

    let mut session = Session::new();
    let key = session.keypair_create(2048, true).expect("key pair");

    let values: Vec<u32> = (1..=256).collect();
    let x = session.plaintext_create(&values);
    let y = session.plaintext_create(&[10]);

    let cx = session.encrypt(key, x).expect("encrypt");
    let sum = session.add_plain(cx, y).expect("add");
    let product = session.multiply(sum, y).expect("multiply");
    let result = session.decrypt(key, product).expect("decrypt");

    let exported = session.plaintext_export(result).expect("export");
    info!("(x + 10) * 10 for x in 1..=4: {:?}", &exported[..4]);
    assert!(
        exported
            .iter()
            .zip(&values)
            .all(|(out, x)| *out == (x + 10) * 10)
    );

    if let Some(ctx) = runtime::current() {
        info!("offload stats: {:?}", ctx.stats());
    }

    for id in [cx, sum, product] {
        session.ciphertext_destroy(id).expect("destroy");
    }
    for id in [x, y, result] {
        session.plaintext_destroy(id).expect("destroy");
    }
    session.keypair_destroy(key).expect("destroy");
    terminate_context();
}
