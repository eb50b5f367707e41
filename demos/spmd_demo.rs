//! Four in-process ranks driven by rank 0.
//!
//! Run with `cargo run --example spmd_demo`. Set `LOCKSTEP_LOG=debug` to see
//! every announcement and dispatch.

use anyhow::Result;
use lockstep::{init_tracing, parallel, Context, LocalGroup, Session, SessionConfig};
use tracing::info;
use xxhash_rust::xxh3::xxh3_64;

const RANKS: usize = 4;

/// Coordinator samples the data; every rank receives it and works on its own
/// stripe, then all stripes are exchanged.
#[parallel]
fn stripe_means(ctx: &Context, samples: Vec<f64>) -> Result<Vec<f64>> {
    let samples = ctx.share(samples)?;
    let stripe: Vec<f64> = samples
        .iter()
        .skip(ctx.rank())
        .step_by(ctx.size())
        .copied()
        .collect();
    let mean = if stripe.is_empty() {
        0.0
    } else {
        stripe.iter().sum::<f64>() / stripe.len() as f64
    };
    info!(rank = ctx.rank(), len = stripe.len(), mean, "stripe done");

    let mut means = Vec::with_capacity(ctx.size());
    for root in 0..ctx.size() {
        means.push(ctx.broadcast(mean, root)?);
    }
    Ok(means)
}

/// Plain function: only ever runs where it is called
fn sample(seed: u64, n: usize) -> Vec<f64> {
    (0..n as u64)
        .map(|i| (xxh3_64(&(seed ^ i).to_le_bytes()) % 1000) as f64 / 10.0)
        .collect()
}

fn main() -> Result<()> {
    let level = std::env::var("LOCKSTEP_LOG").unwrap_or_else(|_| "info".to_string());
    let config = SessionConfig::builder().log_level(level).build()?;
    init_tracing(&config)?;

    let results = LocalGroup::run_configured(RANKS, &config, |comm| {
        let session = Session::builder(&comm).config(config.clone()).build()?;
        session.run(|ctx| -> Result<()> {
            let samples = sample(42, 32);
            info!(count = samples.len(), "sampled on coordinator");
            let means = stripe_means(ctx, samples)?;
            info!(?means, "stripe means");
            Ok(())
        })
    });

    for result in results {
        match result {
            Ok(Ok(summary)) => println!("{}", serde_json::to_string(&summary)?),
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => anyhow::bail!("rank thread panicked"),
        }
    }
    Ok(())
}
