use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use barrage::cli::config::RunConfig;
use barrage::cli::probe::HttpProbe;
use barrage::cli::{resolve_config, Cli, Commands, Overrides};
use barrage::engine::Engine;

/// k6 exit code for failed thresholds.
const EXIT_THRESHOLDS_FAILED: i32 = 99;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("barrage=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            profile,
            base_url,
            vus,
            duration,
            json,
            export_json,
        } => {
            let run_config = resolve_config(
                profile.as_deref(),
                config.as_deref(),
                Overrides {
                    base_url,
                    vus,
                    duration,
                },
            )?;
            let test = run_config.into_plan()?;
            let probe = HttpProbe::new(&test.probe)?;

            if !json {
                println!("Running {} ...", test.probe.url());
            }
            let report = Engine::new(test.plan).run(probe)?;

            if json {
                println!("{}", report.to_json());
            } else {
                report.print_summary();
            }
            if let Some(path) = export_json {
                std::fs::write(&path, report.to_json())?;
                if !json {
                    println!("Report written to {:?}", path);
                }
            }

            if !report.passed() {
                eprintln!("Run did not pass: {} ({:?})", report.state, report.stop_reason);
                std::process::exit(EXIT_THRESHOLDS_FAILED);
            }
            Ok(())
        }
        Commands::Validate { config, base_url } => {
            let mut run_config = RunConfig::load(&config)?;
            if base_url.is_some() {
                run_config.base_url = base_url;
            }
            let test = run_config.into_plan()?;
            println!("✓ {} is valid", config.display());
            println!("  Target:     {}", test.probe.url());
            println!("  Duration:   {:.1}s", test.plan.duration.as_secs_f64());
            println!("  Peak VUs:   {}", test.plan.schedule.max_target());
            println!("  Thresholds: {}", test.plan.thresholds.specs().len());
            Ok(())
        }
        Commands::Schema { output } => {
            let schema = schemars::schema_for!(RunConfig);
            let schema_json = serde_json::to_string_pretty(&schema)?;
            if let Some(out_path) = output {
                std::fs::write(&out_path, schema_json)?;
                println!("JSON Schema written to {:?}", out_path);
            } else {
                println!("{}", schema_json);
            }
            Ok(())
        }
    }
}
