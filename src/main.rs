use clap::Parser;
use handy_conductor::cli::Args;
use handy_conductor::commands::devops::{dispatch, CommandContext};
use handy_conductor::{logging, settings};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    logging::init(args.log.as_deref()).map_err(anyhow::Error::msg)?;

    let config_path = args
        .config
        .clone()
        .unwrap_or_else(settings::default_config_path);
    let settings = settings::load_settings(Some(&config_path))?;

    let ctx = CommandContext {
        settings,
        config_path,
        json: args.json,
    };
    dispatch(&ctx, args.command).await
}
