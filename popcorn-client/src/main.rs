use popcorn_client::{ClientSettings, check_servers, perform_compilation};
use std::fs::OpenOptions;
use std::io::Write;
use std::sync::Mutex;

fn init_logging(settings: &ClientSettings) {
    let builder = tracing_subscriber::fmt()
        .with_max_level(settings.log_level)
        .with_target(false);
    match &settings.log_filename {
        Some(path) => {
            if let Ok(file) = OpenOptions::new().create(true).append(true).open(path) {
                builder
                    .with_ansi(false)
                    .with_writer(Mutex::new(file))
                    .init();
            } else {
                builder.with_writer(std::io::stderr).init();
            }
        }
        None => builder.with_writer(std::io::stderr).init(),
    }
}

#[tokio::main]
async fn main() {
    let settings = ClientSettings::from_env();
    init_logging(&settings);

    let argv: Vec<String> = std::env::args().skip(1).collect();
    if argv.first().map(String::as_str) == Some("--check-servers") {
        check_servers(&settings).await;
        return;
    }
    if argv.len() < 2 {
        eprintln!("Usage: popcorn-client <compiler> <compiler args...>");
        std::process::exit(2);
    }

    let (exit_code, stdout, stderr) = perform_compilation(&argv, &settings).await;

    let _ = std::io::stdout().write_all(&stdout);
    let _ = std::io::stderr().write_all(&stderr);
    std::process::exit(exit_code);
}
