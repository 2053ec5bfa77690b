use clap::Parser;
use color_eyre::eyre::{self, WrapErr};
use console::style;
use pagetiersim::{trace, Config, Simulator};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Two-tier page residency simulator over an L1/L2 cache model"
)]
struct Options {
    /// Event trace to replay; `-` reads from stdin.
    #[clap(long = "trace", help = "event trace to replay ('-' for stdin)")]
    trace: PathBuf,

    /// Optionally dump the final aggregate statistics as JSON.
    #[clap(long = "json-stats", help = "write final stats as JSON")]
    json_stats: Option<PathBuf>,

    #[clap(flatten)]
    config: Config,
}

fn main() -> eyre::Result<()> {
    color_eyre::install()?;
    env_logger::init();

    let options = Options::parse();
    options
        .config
        .validate()
        .wrap_err_with(|| style("invalid configuration").red().bold().to_string())?;

    let sim = Simulator::new(options.config.clone())?;

    let events = if options.trace.as_os_str() == "-" {
        trace::replay(&sim, std::io::stdin().lock())?
    } else {
        let file = File::open(&options.trace)
            .wrap_err_with(|| format!("cannot open trace {}", options.trace.display()))?;
        trace::replay(&sim, BufReader::new(file))?
    };
    log::debug!("replayed {events} events from {}", options.trace.display());

    let report = sim.on_finalize();

    if let Some(path) = options.json_stats {
        let writer = BufWriter::new(
            File::create(&path)
                .wrap_err_with(|| format!("cannot create stats file {}", path.display()))?,
        );
        serde_json::to_writer_pretty(writer, &report)
            .wrap_err("cannot serialize final stats")?;
    }

    Ok(())
}
