use clap::{Parser, Subcommand};
use vanopticon_bifrost::auth::SigningSecret;
use vanopticon_bifrost::{config, observability, run};

#[derive(Parser)]
#[command(name = "bifrost", about = "Bifrost - multi-device configuration sync service")]
struct Cli {
	#[command(subcommand)]
	command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
	/// Run the sync service (default)
	Run {
		/// Override the configured log level
		#[arg(long)]
		log_level: Option<log::Level>,
	},
	/// Print a fresh base64 token signing secret for BFR_TOKEN_SECRET
	GenerateSecret,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	let cli = Cli::parse();

	match cli.command.unwrap_or(Commands::Run { log_level: None }) {
		Commands::GenerateSecret => {
			let secret = SigningSecret::generate()?;
			println!("{}", secret.to_base64());
		}
		Commands::Run { log_level } => {
			let (settings, load_error) = match config::load() {
				Ok(s) => (s, None),
				Err(e) => (config::Settings::default(), Some(e)),
			};

			let obs = observability::init_observability(log_level.unwrap_or(settings.log_level))?;
			if let Some(e) = load_error {
				log::warn!("Failed to load config, using defaults: {}", e);
			}
			log::info!("Loaded settings: host={} port={}", settings.host, settings.port);

			run(settings, obs.metrics).await?;
		}
	}
	Ok(())
}
