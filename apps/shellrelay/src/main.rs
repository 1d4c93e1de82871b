use clap::Parser;
use shellrelay_client_core::terminal::{app, cli::Cli};

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();
    if let Err(err) = app::run(cli).await {
        if !err.already_reported() {
            eprintln!("❌ {err}");
        }
        std::process::exit(err.exit_code());
    }
}
