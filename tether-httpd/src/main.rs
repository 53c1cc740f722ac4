use std::process;

use tether_httpd as httpd;

pub const HELP_MSG: &str = r#"
Usage

   tether-httpd [<option>...]

   Coordinate endpoints expect authentication to be handled by the proxy
   in front of this daemon.

Options

    --listen             <address>      Address to listen on (default 0.0.0.0:3030)
    --version                           Print program version
    --help                              Print help
"#;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let options = parse_options()?;

    httpd::logger::init().expect("global logger hasn't already been set");
    tracing::info!("version {}", httpd::VERSION);

    match httpd::run(options).await {
        Ok(()) => {}
        Err(err) => {
            tracing::error!("Fatal: {:#}", err);
            process::exit(1);
        }
    }
    Ok(())
}

/// Parse command-line arguments into daemon options.
fn parse_options() -> Result<httpd::Options, lexopt::Error> {
    use lexopt::prelude::*;

    let mut parser = lexopt::Parser::from_env();
    let mut listen = None;

    while let Some(arg) = parser.next()? {
        match arg {
            Long("listen") => {
                let addr = parser.value()?.parse()?;
                listen = Some(addr);
            }
            Long("help") | Short('h') => {
                println!("{HELP_MSG}");
                process::exit(0);
            }
            Long("version") => {
                println!("{} {}", httpd::NAME, httpd::VERSION);
                process::exit(0);
            }
            _ => return Err(arg.unexpected()),
        }
    }
    Ok(httpd::Options {
        listen: listen.unwrap_or_else(|| ([0, 0, 0, 0], 3030).into()),
    })
}
