use std::time::Instant;

use itertools::Itertools;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use statrs::distribution::Normal;
use vecchia_lib::{ordering::unpermute, *};

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

/// Draw $y = \bm{B}^{-1}\bm{D}^{1/2}\epsilon$ from the Vecchia approximation itself
fn simulate(factors: &VecchiaFactors, rng: &mut ChaCha8Rng) -> Vec<f64> {
    let normal = Normal::new(0., 1.).unwrap();
    let eps: Vec<f64> = factors
        .d
        .iter()
        .map(|d| d.sqrt() * rng.sample(normal))
        .collect();
    factors.b.solve_lower(&eps)
}

fn main() -> Result<(), VecchiaError> {
    env_logger::init();
    let config = match std::env::args().nth(1) {
        Some(path) => VecchiaConfig::from_toml_file(path)?,
        None => VecchiaConfig::default(),
    };
    println!("{config:?}");

    let n: usize = 2_000;
    let mut rng = ChaCha8Rng::seed_from_u64(config.seed);
    let coords = Coords::from_fn(n, 2, |_, _| rng.gen::<f64>());
    let inducing = config
        .uses_inducing_points()
        .then(|| Coords::from_fn(50, 2, |_, _| rng.gen::<f64>()));
    let params = Params::new(vec![1., 0.1], 0.05);

    let now = Instant::now();
    let mut model =
        VecchiaModel::new(Covariance::Matern32, coords, inducing, None, params, config)?;
    println!("Elapsed, neighbours: {:.2?}", now.elapsed());

    let now = Instant::now();
    let y = simulate(model.build_factors(FactorOptions::default())?, &mut rng);
    let y = unpermute(&y, model.ordering());
    println!("Elapsed, factors: {:.2?}", now.elapsed());

    let now = Instant::now();
    println!("log-likelihood {}", model.log_likelihood(&y)?);
    println!("Elapsed, likelihood: {:.2?}", now.elapsed());

    if model.inducing().is_none() {
        let now = Instant::now();
        println!(
            "gradient {:?}",
            model.log_likelihood_gradient(&y, GradScale::Log)?
        );
        println!("Elapsed, gradient: {:.2?}", now.elapsed());
    }
    if model.on_convergence()? {
        println!("conditioning sets changed");
    }

    let m = 20;
    let range: Vec<f64> = (0..m).map(|i| (i as f64 + 0.5) / m as f64).collect();
    let rows: Vec<Vec<f64>> = range
        .clone()
        .into_iter()
        .cartesian_product(range)
        .map(|(a, b)| vec![a, b])
        .collect();
    let pred = Coords::from_rows(&rows)?;
    let opts = PredictOptions::default();
    for mode in [
        PredictionMode::ObservedFirstCondObsOnly,
        PredictionMode::ObservedFirstCondAll,
        PredictionMode::PredictedFirst,
        PredictionMode::LatentCondAll,
    ] {
        let now = Instant::now();
        match model.predict(&y, &pred, None, mode, &opts) {
            Ok(p) => println!(
                "{mode:?}: mean[0] {:.4}, var[0] {:.4}",
                p.mean[0],
                p.var.map_or(f64::NAN, |v| v[0])
            ),
            Err(e) => println!("{mode:?}: {e}"),
        }
        println!("Elapsed, {mode:?}: {:.2?}", now.elapsed());
    }
    Ok(())
}
