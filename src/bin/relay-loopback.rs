//! Loopback relay demo.
//!
//! Runs a client against an in-process relay peripheral and a simulated
//! card, sending the APDUs given on the command line as one sequence.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin relay-loopback -- 00A4040000 80CA9F7F00
//! RELAY_CONFIG=relay.json cargo run --bin relay-loopback -- 00A4040000
//! ```
//!
//! The simulated card answers `90 00` to every command.

use apdu_ble_relay::card::SimulatedCard;
use apdu_ble_relay::loopback::LoopbackLink;
use apdu_ble_relay::{ApduEnvelope, ClientConversation, RelayConfig, RelayError};
use log::{error, info};

fn main() {
    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if let Err(e) = run() {
        error!("{}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = match std::env::var("RELAY_CONFIG") {
        Ok(path) => RelayConfig::load(&path)?,
        Err(_) => RelayConfig::default(),
    };

    let commands: ApduEnvelope = std::env::args()
        .skip(1)
        .map(|arg| hex::decode(arg.trim()))
        .collect::<Result<_, _>>()?;
    if commands.is_empty() {
        return Err("usage: relay-loopback <hex APDU>...".into());
    }

    info!("=== APDU relay loopback ({} format) ===", config.format);

    let link = LoopbackLink::spawn(&config, Box::new(SimulatedCard::always_ok()))?;
    let mut client = ClientConversation::new(link, &config)?;
    client.connect()?;
    info!("Negotiated capacity: {} bytes", client.max_transceive_length());

    let responses = client.transceive(&commands)?;
    if responses.len() != commands.len() {
        return Err(RelayError::ResponseCountMismatch {
            expected: commands.len(),
            actual: responses.len(),
        }
        .into());
    }
    for (command, response) in commands.iter().zip(responses.iter()) {
        println!(
            "{} -> {}",
            hex::encode_upper(command),
            hex::encode_upper(response)
        );
    }

    client.close();
    Ok(())
}
