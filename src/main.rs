use nmfit::prelude::*;

fn print_help() {
    println!("nmfit demo: fit a delay-coupled linear model to synthetic data");
    println!();
    println!("Usage: nmfit [EPOCHS]");
    println!();
    println!("Set RUST_LOG=debug for per-window losses.");
}

fn main() {
    tracing_subscriber::fmt::init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() >= 2 && (args[1] == "--help" || args[1] == "-h" || args[1] == "help") {
        print_help();
        return;
    }
    let epochs = match args.get(1).map(|a| a.parse::<usize>()) {
        None => 20,
        Some(Ok(n)) => n,
        Some(Err(_)) => {
            eprintln!("EPOCHS must be a non-negative integer, got {}", args[1]);
            print_help();
            std::process::exit(2);
        }
    };

    if let Err(e) = run(epochs) {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}

fn run(epochs: usize) -> Result<()> {
    let cfg = DelayedLinearConfig::default()
        .with_nodes(6, 6)
        .with_grid(10, 20)
        .with_delay(4)
        .with_fit_gains(true);
    let num_windows = 8;

    // Ground truth: stronger coupling and slower decay than the initial guess.
    let mut truth = DelayedLinear::ring(cfg.clone().with_seed(2024))?;
    truth.set_scalar("g", 0.8)?;
    truth.set_scalar("decay", 0.7)?;
    truth.set_scalar("std_in", 0.2)?;
    let series = simulate(&mut truth, num_windows, 2, None, IcMode::Training)?;
    let recording =
        EmpiricalRecording::from_series(&series.get("signal")?.data, cfg.trs_per_window)?;

    let model = DelayedLinear::ring(cfg)?;
    let mut fit = ModelFitting::new(model, TrainingSet::single(recording), epochs, TimeSeriesCost)?;

    let train_cfg = TrainConfig::default().with_early_stop(5, 0.9);
    let outcome = fit.train(&train_cfg, None)?;
    println!("outcome: {:?}", outcome);

    let diag = fit.evaluate(2, None)?;
    println!("evaluation: fc_cor={:.3} cos_sim={:.3}", diag.fc_cor, diag.cos_sim);

    let snap = FittingAdapter::new(&fit).snapshot();
    println!("windows processed: {}", snap.windows_processed);
    if let Some(best) = snap.best {
        println!(
            "best recording pass: epoch {} fc_cor={:.3}",
            best.epoch, best.diagnostics.fc_cor
        );
    }
    for p in snap.fitted.iter().filter(|p| p.value.len() == 1) {
        println!("  {:<8} {:?} = {:.4}", p.name, p.group, p.value[0]);
    }
    println!(
        "truth: g={:.4} decay={:.4} std_in={:.4}",
        truth.scalar("g")?,
        truth.scalar("decay")?,
        truth.scalar("std_in")?
    );

    println!("session image: {} bytes", fit.image_size_bytes()?);
    Ok(())
}
