//! A small demo: infer the mean of a 2D Gaussian from ten observations with one random-walk
//! update per coordinate, showing progress and saving the chain to `chain.csv`.

use mcmc_updates::adaptation::{AdaptationUnifRW, UnifRwAdaptationConfig};
use mcmc_updates::callbacks::{ProgressCallback, SavingCallback};
use mcmc_updates::distributions::{Data, GaussianLaw};
use mcmc_updates::kernels::UniformRandomWalk;
use mcmc_updates::priors::ImproperPrior;
use mcmc_updates::sampler::Mcmc;
use mcmc_updates::update::RandomWalkUpdate;
use nalgebra as na;
use ndarray::{s, Array1, Axis};
use rand::rngs::SmallRng;
use rand::SeedableRng;
use std::error::Error;

fn main() -> Result<(), Box<dyn Error>> {
    const ITERATIONS: usize = 10_000;
    const BURNIN: usize = 1_000;
    const N_OBS: usize = 10;
    const SEED: u64 = 42;

    let cov = na::DMatrix::from_row_slice(2, 2, &[1.0, 0.5, 0.5, 1.0]);
    let law = GaussianLaw::new(vec![1.0, 2.0], cov)?;
    let observations = law.simulate(&mut SmallRng::seed_from_u64(SEED), N_OBS);
    let data = Data::new(law, observations);

    let mut mcmc = Mcmc::new(data, vec![0.0, 0.0], ITERATIONS)
        .add_callback(ProgressCallback::new()?)
        .add_callback(SavingCallback::new("chain.csv").set_checkpoints((0..ITERATIONS).step_by(1_000)))
        .set_seed(SEED);
    for coord in 0..2 {
        let kernel = UniformRandomWalk::isotropic(1.0, 1)?;
        let adaptation = AdaptationUnifRW::new(&kernel, UnifRwAdaptationConfig::default())?;
        mcmc = mcmc.add_update(RandomWalkUpdate::new(kernel, adaptation, ImproperPrior, vec![coord])?);
    }

    let output = mcmc.run()?;
    let global = &output.global;

    // Last slot of every iteration after burn-in
    let samples = global.state_history.slice(s![BURNIN.., 1, ..]);
    let mean: Array1<f64> = samples
        .mean_axis(Axis(0))
        .ok_or("no samples after burn-in")?;
    println!("Posterior mean: ({:.2}, {:.2})", mean[0], mean[1]);
    println!("Running mean:   {:.2}", global.stats.mean());
    for slot in 0..global.num_slots() {
        if let Some(rate) = global.stats.acceptance_rate(slot) {
            println!("Slot {slot} acceptance rate: {rate:.3}");
        }
    }
    Ok(())
}
