mod mock_relay;
mod sequence_run;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "vts")]
#[command(about = "IEC 61850 virtual test set", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// List the interfaces known to the raw-frame backend.
    Interfaces,
    /// Offline end-to-end check: publisher, sniffer, analyzer and a mock
    /// relay on the loopback bus, finishing with an overcurrent point.
    SelfTest {
        #[arg(long, default_value = "lo0")]
        interface: String,

        /// Stream sample rate in Hz.
        #[arg(long, default_value_t = 4800)]
        sample_rate: u32,

        /// Seconds of steady-state streaming before the fault is applied.
        #[arg(long, default_value_t = 2.0)]
        warmup: f64,
    },
    /// Run a sequence description (streams + states) from a JSON file.
    Sequence {
        #[arg(long)]
        config: String,

        #[arg(long, default_value = "lo0")]
        interface: String,
    },
    /// Run a standalone mock relay until interrupted.
    MockRelay {
        #[arg(long, default_value = "lo0")]
        interface: String,

        #[arg(long, default_value = "RelayA")]
        gocb_ref: String,

        #[arg(long, default_value_t = 150.0)]
        pickup: f64,

        #[arg(long, default_value_t = 0.1)]
        tms: f64,

        /// IDMT curve (SI, VI, EI, LTI, MI, IEEE_VI, IEEE_EI, DT, INST).
        #[arg(long, default_value = "SI")]
        curve: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Cli::parse();
    match args.command {
        Commands::Interfaces => {
            for info in vts_core::io::interfaces() {
                println!(
                    "{:<12} {} {}",
                    info.name,
                    info.mac,
                    if info.active { "up" } else { "down" }
                );
            }
        }
        Commands::SelfTest {
            interface,
            sample_rate,
            warmup,
        } => {
            self_test::run(&interface, sample_rate, warmup)?;
        }
        Commands::Sequence { config, interface } => {
            sequence_run::run(&config, &interface)?;
        }
        Commands::MockRelay {
            interface,
            gocb_ref,
            pickup,
            tms,
            curve,
        } => {
            let settings = mock_relay::MockRelaySettings {
                gocb_ref,
                pickup_current: pickup,
                tms,
                curve: curve.parse()?,
                ..mock_relay::MockRelaySettings::default()
            };
            let port = vts_core::io::bind(&interface)?;
            let stop = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
            let relay_stop = std::sync::Arc::clone(&stop);
            let handle =
                std::thread::spawn(move || mock_relay::run_mock_relay(port, settings, relay_stop));

            tokio::signal::ctrl_c().await?;
            log::info!("shutting down mock relay");
            stop.store(true, std::sync::atomic::Ordering::Release);
            let _ = handle.join();
        }
    }
    Ok(())
}
