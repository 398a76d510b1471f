use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use ndarray::{stack, Array2, Axis};
use ndarray_npy::write_npy;
use ndarray_rand::rand_distr::StandardNormal;
use ndarray_rand::RandomExt;
use rand::rngs::StdRng;
use rand::SeedableRng;

use decorr_core::data::{DEFAULT_COVARIANCE_KEY, DEFAULT_DATA_KEY};
use decorr_core::logger::{self, info, warn};
use decorr_core::{
    cov_matrix, estimate_cov, inverse_sqrt_matrix, load_channel_stack, load_covariance, regularize,
    AcquisitionGeometry, ChannelMixing, DecorrError, LinearOperator,
};

/// Noise decorrelation for multi-material CT data.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Estimate the channel covariance of an NPZ data set and write its whitening matrix
    Estimate(EstimateArgs),
    /// Run the estimator on synthetic white noise and report the results
    Demo(DemoArgs),
}

/// Expected NPZ file structure:
///   - key "data" (see --key): 3D array (k, H, W) of f32 or f64
///   - key "crlb" (optional, see --covariance-key): 2D array (k, k)
#[derive(Args, Debug)]
struct EstimateArgs {
    /// Path to NPZ file containing the material channels
    #[arg(long)]
    data: PathBuf,

    /// Name of the channel stack inside the NPZ file
    #[arg(long, default_value = DEFAULT_DATA_KEY)]
    key: String,

    /// Path to geometry JSON, checked against the sinogram shape
    #[arg(long, conflicts_with = "geometry_preset")]
    geometry: Option<PathBuf>,

    /// Built-in scanner geometry, checked against the sinogram shape
    #[arg(long, value_enum)]
    geometry_preset: Option<GeometryPreset>,

    /// Use a precomputed covariance matrix from the NPZ file instead of estimating it
    #[arg(long, num_args = 0..=1, default_missing_value = DEFAULT_COVARIANCE_KEY)]
    covariance_key: Option<String>,

    /// Add this multiple of the identity to the covariance if it is not positive definite
    #[arg(long)]
    regularize: Option<f64>,

    /// Output path for the whitening matrix (.npy)
    #[arg(long)]
    output: PathBuf,

    /// Output path for the whitened channel stack (.npy)
    #[arg(long)]
    whitened_output: Option<PathBuf>,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq)]
enum GeometryPreset {
    /// 180 angles, 853 detector cells
    Parallel,
    /// 360 angles, 883 flat detector cells
    Fan,
}

impl GeometryPreset {
    fn geometry(self) -> AcquisitionGeometry {
        match self {
            GeometryPreset::Parallel => AcquisitionGeometry::reference_parallel(),
            GeometryPreset::Fan => AcquisitionGeometry::reference_fan_flat(),
        }
    }
}

#[derive(Args, Debug)]
struct DemoArgs {
    /// Side length of the square noise images
    #[arg(long, default_value_t = 50)]
    size: usize,

    /// Seed for the noise generator
    #[arg(long, default_value_t = 0)]
    seed: u64,
}

fn main() -> Result<()> {
    logger::init();

    match Cli::parse().command {
        Command::Estimate(args) => run_estimate(&args),
        Command::Demo(args) => run_demo(&args),
    }
}

fn run_estimate(args: &EstimateArgs) -> Result<()> {
    // --- Load channel stack ---
    let channels = load_channel_stack(&args.data, &args.key)
        .map_err(|e| anyhow::anyhow!("Failed to load '{}' from {:?}: {}", args.key, args.data, e))?;
    let (k, h, w) = channels.dim();
    info!("Loaded {} channels of shape {}x{} from {:?}", k, h, w, args.data);

    // --- Verify geometry consistency ---
    if let Some(geometry) = resolve_geometry(args)? {
        geometry
            .check_stack(channels.shape())
            .map_err(|e| anyhow::anyhow!("Data does not match geometry: {}", e))?;
        info!("Geometry: {:?}", geometry);
    }

    // --- Covariance: precomputed or estimated ---
    let covariance = match &args.covariance_key {
        Some(key) => load_covariance(&args.data, key)
            .map_err(|e| anyhow::anyhow!("Failed to load covariance '{}' from {:?}: {}", key, args.data, e))?,
        None => cov_matrix(channels.view())?,
    };
    if covariance.nrows() != k {
        bail!("Covariance matrix is {}x{} but data has {} channels", covariance.nrows(), covariance.ncols(), k);
    }
    info!("Covariance matrix: {:?}", covariance);

    // --- Whitening matrix ---
    let whitening = match inverse_sqrt_matrix(covariance.view()) {
        Ok(whitening) => whitening,
        Err(e @ DecorrError::NotPositiveDefinite { .. }) => match args.regularize {
            Some(epsilon) => {
                warn!("{}; retrying with {:e} added to the diagonal", e, epsilon);
                inverse_sqrt_matrix(regularize(covariance.view(), epsilon).view())?
            }
            None => bail!("{} (pass --regularize <EPS> to add a diagonal shift)", e),
        },
        Err(e) => return Err(e.into()),
    };
    info!("Whitening matrix: {:?}", whitening);

    write_npy(&args.output, &whitening)
        .map_err(|e| anyhow::anyhow!("Failed to write output NPY {:?}: {}", args.output, e))?;
    info!("Whitening matrix written to {:?}", args.output);

    // --- Optionally whiten the data itself ---
    if let Some(path) = &args.whitened_output {
        let op = ChannelMixing::new(whitening)?;
        let whitened = op.apply(channels.view())?;
        info!("Covariance after whitening: {:?}", cov_matrix(whitened.view())?);

        write_npy(path, &whitened)
            .map_err(|e| anyhow::anyhow!("Failed to write whitened NPY {:?}: {}", path, e))?;
        info!("Whitened data written to {:?}", path);
    }

    Ok(())
}

fn resolve_geometry(args: &EstimateArgs) -> Result<Option<AcquisitionGeometry>> {
    if let Some(path) = &args.geometry {
        let geometry = AcquisitionGeometry::from_json_file(path)
            .map_err(|e| anyhow::anyhow!("Failed to read geometry JSON {:?}: {}", path, e))?;
        return Ok(Some(geometry));
    }
    Ok(args.geometry_preset.map(GeometryPreset::geometry))
}

fn run_demo(args: &DemoArgs) -> Result<()> {
    let mut rng = StdRng::seed_from_u64(args.seed);
    let shape = (args.size, args.size);

    let i1 = Array2::<f64>::random_using(shape, StandardNormal, &mut rng);
    let i2 = Array2::<f64>::random_using(shape, StandardNormal, &mut rng) * 3.0;
    let correlated = &i1 + &i2;

    info!("Synthetic noise, {}x{}, seed {}", args.size, args.size, args.seed);
    info!("cov(I1, I1)   = {:8.4}  (expected 1)", estimate_cov(i1.view(), i1.view())?);
    info!("cov(I1, I2)   = {:8.4}  (expected 0)", estimate_cov(i1.view(), i2.view())?);
    info!("cov(I2, I1)   = {:8.4}  (expected 0)", estimate_cov(i2.view(), i1.view())?);
    info!("cov(I2, I2)   = {:8.4}  (expected 9)", estimate_cov(i2.view(), i2.view())?);
    info!("cov(I1, corr) = {:8.4}  (expected 1)", estimate_cov(i1.view(), correlated.view())?);

    let channels = stack(Axis(0), &[i1.view(), correlated.view()])?;
    let covariance = cov_matrix(channels.view())?;
    let op = ChannelMixing::whitening(covariance.view())?;
    let whitened = op.apply(channels.view())?;
    info!("Covariance of [I1, corr]: {:?}", covariance);
    info!("Covariance after whitening: {:?}", cov_matrix(whitened.view())?);

    Ok(())
}
