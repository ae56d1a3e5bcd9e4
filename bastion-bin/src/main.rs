use bastion_cli::Cli;
use clap::Parser;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = cli.run().await {
        eprintln!("❌ Error: {e}");
        for issue in e.issues() {
            eprintln!("   - {issue}");
        }
        std::process::exit(1);
    }
}
