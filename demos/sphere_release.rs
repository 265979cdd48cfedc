use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use clap::Parser;
use log::{error, info};

use driftwood::config::{EngineConfig, ObstacleArguments, ObstacleConfig};
use driftwood::context::{Context, StepContext};
use driftwood::engine::{Engine, Kernel};
use driftwood::error::Result;
use driftwood::geometry::{AccelDecel, Sphere};
use driftwood::grid::{BlockGrid, BlockSource, Boundary, GridSpec};
use driftwood::kernels::{self, Enstrophy};
use driftwood::math;
use driftwood::message::{Communicator, LocalCommunicator};
use driftwood::obstacle::Obstacle;
use driftwood::obstacle_vector::ObstacleVector;




#[derive(Debug, Clone, Parser)]
#[clap(version, about = "Release a sphere into a uniform stream and follow its motion")]
struct Opts {
    #[clap(short = 'r', long, default_value = "1")]
    num_ranks: usize,

    #[clap(short = 't', long, default_value = "0")]
    num_threads: usize,

    #[clap(long)]
    pin_threads: bool,

    #[clap(short = 'b', long, default_value = "4")]
    blocks_per_dim: usize,

    #[clap(short = 's', long, default_value = "8")]
    block_size: usize,

    #[clap(short = 'n', long, default_value = "100")]
    num_steps: u64,

    #[clap(long, default_value = "0.2")]
    radius: f64,

    #[clap(long, default_value = "0.1")]
    stream: f64,

    /// Prescribe an accelerate-decelerate velocity profile peaking at this
    /// speed, instead of solving for the velocity
    #[clap(long)]
    umax: Option<f64>,

    #[clap(long, default_value = "1.0")]
    tmax: f64,

    #[clap(long, default_value = "0.25")]
    cfl: f64,

    /// Penalization coefficient; by default 1/dt, so that bodies take the
    /// mean velocity of the fluid they cover
    #[clap(long)]
    lambda: Option<f64>,

    #[clap(long, default_value = "1e-3")]
    nu: f64,

    #[clap(long, default_value = "10")]
    checkpoint_interval: u64,

    #[clap(short = 'o', long, default_value = "driftwood-output")]
    output: PathBuf,

    #[clap(long)]
    restart: bool,

    #[clap(long, default_value = "info")]
    log_level: log::LevelFilter,
}




// ============================================================================
fn run<C: Communicator>(opts: &Opts, comm: &C, mut grid: BlockGrid, stop: &AtomicBool) -> Result<()> {
    let engine = Engine::new(&EngineConfig { num_threads: opts.num_threads, pin_threads: opts.pin_threads })?;
    let mut ctx = Context::new(opts.output.clone(), comm.rank());
    let restart_prefix = opts.output.join("restart_obstacle");
    let h = grid.spec().h;
    let extent = grid.spec().extent();
    let stream = opts.stream;

    grid.fill(|_| [stream, 0.0, 0.0, 0.0, 0.0]);

    let args = ObstacleArguments {
        length: 2.0 * opts.radius,
        position: extent.map(|x| 0.5 * x),
        ..Default::default()
    };
    let mut sphere = Sphere::new(opts.radius);
    sphere.accel_decel = opts.umax.map(|umax| AccelDecel { umax, tmax: opts.tmax });

    let mut obstacles = ObstacleVector::new();
    obstacles.push(Obstacle::new(0, args, Box::new(sphere), ObstacleConfig::default())?);

    if opts.restart {
        obstacles.restart(&restart_prefix, comm.rank())?;
    }
    if comm.rank() == 0 {
        info!(
            "{} obstacle(s), length scale {}, {} blocks of {}^3 cells over {} rank(s)",
            obstacles.len(), obstacles.length(), grid.spec().num_blocks(), opts.block_size, comm.size());
    }

    let vorticity = Enstrophy::default().stencil();
    let interval = opts.checkpoint_interval.max(1);
    let mut time = 0.0;

    for n in 0..opts.num_steps {
        let interrupted = if stop.load(Ordering::Relaxed) { 1.0 } else { 0.0 };

        if comm.all_reduce_max(&[interrupted])[0] > 0.0 {
            info!("rank {} stopping after step {}", comm.rank(), n);
            break;
        }

        let uinf = obstacles.frame_velocity();
        let body_speed = obstacles.iter().map(|o| math::norm(o.state().trans_vel)).fold(0.0, f64::max);
        let umax = kernels::max_velocity(&engine, &mut grid, comm, uinf)?.max(body_speed);
        let dt = if umax > 0.0 { opts.cfl * h / umax } else { opts.cfl * h };

        let step = StepContext {
            step: n,
            time,
            dt,
            uinf,
            lambda: opts.lambda.unwrap_or(1.0 / dt),
            nu: opts.nu,
            dump: n % interval == 0,
        };

        let token = obstacles.create(&engine, &mut grid, comm, &step, &mut ctx, |grid| {
            grid.begin_halo_exchange(&vorticity)
        })?;
        let enstrophy = kernels::enstrophy(&engine, &mut grid, comm, Some(token))?;

        if let Some((i, j)) = obstacles.colliding_obstacles_global(comm, &mut ctx) {
            info!("obstacles {} and {} share blocks at step {}", i, j, n);
        }

        obstacles.characteristic_function(&mut grid)?;
        obstacles.compute_velocities(&engine, &mut grid, comm, &step, &mut ctx)?;
        obstacles.compute_forces(&engine, &mut grid, comm, &step, &mut ctx)?;
        obstacles.update(&step, &mut ctx)?;
        time += dt;

        if (n + 1) % interval == 0 {
            if comm.rank() == 0 {
                obstacles.save(time, &restart_prefix)?;
            }
            ctx.diagnostics.flush()?;
        }
        if comm.rank() == 0 {
            if let Some(o) = obstacles.get(0) {
                info!(
                    "[{:05}] t={:.4} dt={:.3e} x={:.6?} u={:.6?} enstrophy={:.3e}",
                    n, time, dt, o.state().position, o.state().trans_vel, enstrophy);
            }
        }
    }

    if comm.rank() == 0 {
        obstacles.save(time, &restart_prefix)?;
        ctx.profiler.log_summary();
    }
    ctx.diagnostics.flush()?;
    Ok(())
}




// ============================================================================
fn main() {
    let opts = Opts::parse();

    simple_logger::SimpleLogger::new()
        .with_level(opts.log_level)
        .init()
        .unwrap();

    let stop = Arc::new(AtomicBool::new(false));

    for signal in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
        signal_hook::flag::register(signal, Arc::clone(&stop)).unwrap();
    }

    let spec = GridSpec {
        blocks_per_dim: [opts.blocks_per_dim; 3],
        block_size: opts.block_size,
        h: 1.0 / (opts.blocks_per_dim * opts.block_size) as f64,
        origin: [0.0; 3],
        boundary: Boundary::Periodic,
    };
    let grids = match BlockGrid::partitioned(spec, opts.num_ranks) {
        Ok(grids) => grids,
        Err(e) => {
            error!("{}", e);
            std::process::exit(1)
        }
    };

    let handles: Vec<_> = LocalCommunicator::group(opts.num_ranks)
        .into_iter()
        .zip(grids)
        .map(|(comm, grid)| {
            let opts = opts.clone();
            let stop = stop.clone();

            thread::spawn(move || {
                if let Err(e) = run(&opts, &comm, grid, &stop) {
                    comm.abort(&e)
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }
}
