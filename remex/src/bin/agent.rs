use clap::{App, Arg, SubCommand};
use color_eyre::eyre::{eyre, Report, WrapErr};
use remex::agent::{child_main, Agent, ChildInvoker, DynamicResolver};
use remex::config::{Config, DEFAULT_AGENT_PORT};

#[tokio::main]
async fn main() -> Result<(), Report> {
    color_eyre::install()?;

    let default_port = DEFAULT_AGENT_PORT.to_string();
    let matches = App::new("remex-agent")
        .version("0.1")
        .about("Serves remote-execution calls, rooted at a synced directory.")
        .arg(
            Arg::with_name("path")
                .value_name("PATH")
                .help("root directory for dynamic modules and sync")
                .default_value("."),
        )
        .arg(
            Arg::with_name("port")
                .short("p")
                .long("port")
                .value_name("PORT")
                .help("port to listen on")
                .default_value(&default_port),
        )
        .arg(
            Arg::with_name("logging")
                .short("l")
                .long("logging")
                .value_name("LEVEL")
                .help("log level (error, warning, info, debug, trace)")
                .default_value("warning"),
        )
        .subcommand(
            SubCommand::with_name("child")
                .about("per-call bootstrap: one request on stdin, one reply on stdout")
                .arg(
                    Arg::with_name("path")
                        .value_name("PATH")
                        .help("root directory for dynamic modules")
                        .default_value("."),
                ),
        )
        .get_matches();

    // child bootstrap: stdout carries the reply frame, so no logging there
    if let Some(child) = matches.subcommand_matches("child") {
        let path = child.value_of("path").expect("path has a default");
        let resolver = DynamicResolver::new(path);
        return child_main(resolver).await;
    }

    let path = matches.value_of("path").expect("path has a default");
    let port: u16 = matches
        .value_of("port")
        .expect("port has a default")
        .parse()
        .wrap_err("invalid port")?;
    init_tracing(matches.value_of("logging").expect("logging has a default"))?;

    let resolver = DynamicResolver::new(path);
    let invoker = ChildInvoker::current_exe(vec![
        "child".to_string(),
        path.to_string(),
    ])?;
    let agent = Agent::new(resolver, Box::new(invoker), Config::new());

    let local = tokio::task::LocalSet::new();
    local.run_until(agent.run(port)).await
}

fn init_tracing(level: &str) -> Result<(), Report> {
    let level = match level.to_ascii_lowercase().as_str() {
        "error" => tracing::Level::ERROR,
        "warning" | "warn" => tracing::Level::WARN,
        "info" => tracing::Level::INFO,
        "debug" => tracing::Level::DEBUG,
        "trace" => tracing::Level::TRACE,
        other => return Err(eyre!("unknown log level: {}", other)),
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();
    Ok(())
}
