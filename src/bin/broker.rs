use argh::FromArgs;
use parlor::Broker;
use std::process;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

/// Chat relay broker: accepts participants on a control endpoint and a
/// file endpoint and relays framed traffic between them.
#[derive(FromArgs)]
struct BrokerArgs {
    /// whether or not to enable debugging
    #[argh(switch, short = 'd')]
    debugging: bool,

    /// the control endpoint TCP port
    #[argh(positional)]
    control_port: u16,

    /// the file endpoint TCP port
    #[argh(positional)]
    file_port: u16,
}

#[tokio::main]
async fn main() {
    let args: BrokerArgs = argh::from_env();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(if args.debugging {
            Level::DEBUG
        } else {
            Level::INFO
        })
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    let broker = match Broker::bind(args.control_port, args.file_port).await {
        Ok(broker) => broker,
        Err(e) => {
            error!("Failed to bind: {e}");
            process::exit(1);
        }
    };
    info!(
        control = args.control_port,
        file = args.file_port,
        "broker listening"
    );

    if let Err(e) = broker.run().await {
        error!("Broker failed: {e}");
        process::exit(1);
    }
}
