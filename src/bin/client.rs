use argh::FromArgs;
use parlor::ChatClient;
use std::process;
use tracing::{error, Level};
use tracing_subscriber::FmtSubscriber;

/// Terminal chat client: relays standard input to the room and prints room
/// traffic to standard output.
#[derive(FromArgs)]
struct ClientArgs {
    /// whether or not to enable debugging
    #[argh(switch, short = 'd')]
    debugging: bool,

    /// the broker host name or address
    #[argh(positional)]
    host: String,

    /// the broker's control endpoint TCP port
    #[argh(positional)]
    control_port: u16,

    /// the broker's file endpoint TCP port
    #[argh(positional)]
    file_port: u16,
}

#[tokio::main]
async fn main() {
    let args: ClientArgs = argh::from_env();

    // chat output owns stdout; logging goes to stderr
    let subscriber = FmtSubscriber::builder()
        .with_max_level(if args.debugging {
            Level::DEBUG
        } else {
            Level::WARN
        })
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    let client = match ChatClient::connect(&args.host, args.control_port, args.file_port).await {
        Ok(client) => client,
        Err(e) => {
            error!("Failed to connect: {e}");
            process::exit(1);
        }
    };
    println!("Connected");

    if let Err(e) = client.run().await {
        error!("Client failed: {e}");
        process::exit(1);
    }
}
