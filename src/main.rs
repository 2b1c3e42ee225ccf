//! Metaloop - self-maintenance orchestrator
//!
//! Runs scheduled self-audits, code reviews, refactor proposals and
//! capability-gap tracking for an autonomous assistant, all behind a
//! kill switch.

use anyhow::Result;
use metaloop::cli::{
    feature, init, kill_switch, load_config, meta, open_database, print_dashboard_json,
    print_dashboard_text, print_report_json, print_report_text, print_settings_text, review, run,
    Cli, Commands, OutputFormat,
};
use metaloop::dashboard::Dashboard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let cli = Cli::parse_args();

    // Setup logging; stdout is reserved for command output
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    let (config, config_path) = load_config(cli.config.as_deref())?;
    let db_override = cli.db.as_deref();

    // Execute command
    match cli.command {
        Commands::Init(args) => {
            init(&config_path, db_override, args.force)?;
        }

        Commands::Run(args) => {
            let db = open_database(&config, db_override)?;

            if args.dashboard {
                let dashboard = Dashboard::collect(&db)?;
                match cli.format {
                    OutputFormat::Json => print_dashboard_json(&dashboard)?,
                    OutputFormat::Text => print_dashboard_text(&dashboard),
                }
                return Ok(());
            }

            let report = run(&db, &config, args.options()).await?;
            match cli.format {
                OutputFormat::Json => print_report_json(&report)?,
                OutputFormat::Text => print_report_text(&report),
            }
        }

        Commands::Meta(args) => {
            let db = open_database(&config, db_override)?;
            let reply = meta(&db, &args.subcommand);
            match cli.format {
                OutputFormat::Json => {
                    println!("{}", serde_json::json!({ "reply": reply }));
                }
                OutputFormat::Text => println!("{}", reply),
            }
        }

        Commands::KillSwitch(args) => {
            let db = open_database(&config, db_override)?;
            let settings = kill_switch(&db, args.state.is_on())?;
            match cli.format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&settings)?),
                OutputFormat::Text => print_settings_text(&settings),
            }
        }

        Commands::Feature(args) => {
            let db = open_database(&config, db_override)?;
            let settings = feature(&db, &args.name, args.state.is_on())?;
            match cli.format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&settings)?),
                OutputFormat::Text => print_settings_text(&settings),
            }
        }

        Commands::Review(args) => {
            let db = open_database(&config, db_override)?;
            let line = review(
                &db,
                args.target,
                &args.id,
                &args.status,
                args.feedback.as_deref(),
            )?;
            println!("{}", line);
        }
    }

    Ok(())
}
