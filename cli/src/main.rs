use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use soundpay_core::{
    loopback, DecoderState, EscalationController, EscalationOutcome, InMemoryBackend, Microphone,
    NoHaptics, PaymentBackend, SpectralDecoder, Speaker, Token, ToneEncoder, TOKEN_HEX_CHARS,
};

mod config;
#[cfg(feature = "device")]
mod device;
mod error;
mod server;
mod wav;

use config::Settings;
use error::{CliError, Result};

#[derive(Parser)]
#[command(name = "soundpay")]
#[command(about = "Send and receive payment tokens over sound")]
struct Cli {
    /// JSON file with `decoder` and `escalation` overrides
    #[arg(long, global = true, value_name = "FILE.JSON")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Render one broadcast of a token to a WAV file
    Encode {
        #[arg(value_name = "TOKEN")]
        token: String,

        #[arg(value_name = "OUTPUT.WAV")]
        output: PathBuf,

        /// Which escalation profile to use (1 = quietest)
        #[arg(short, long, default_value = "1")]
        attempt: usize,
    },

    /// Decode every token found in a WAV file
    Decode {
        #[arg(value_name = "INPUT.WAV")]
        input: PathBuf,
    },

    /// Print the token derived from a payment id
    Token {
        #[arg(value_name = "PAYMENT_ID")]
        payment_id: String,

        #[arg(long, default_value_t = TOKEN_HEX_CHARS)]
        hex_chars: usize,
    },

    /// Run the whole payer/payee exchange over a simulated speaker and microphone
    Simulate {
        #[arg(value_name = "PAYMENT_ID")]
        payment_id: String,

        /// Settle on this status poll instead of when the payee redeems
        #[arg(long)]
        confirm_after_polls: Option<u32>,

        /// Number of leading broadcasts the payee never hears
        #[arg(long, default_value = "0")]
        drop_attempts: usize,
    },

    /// Serve a mock payment backend over HTTP
    Serve {
        #[arg(long, default_value = "127.0.0.1:8080")]
        bind: SocketAddr,
    },

    /// Play a token through the default output device
    #[cfg(feature = "device")]
    Broadcast {
        #[arg(value_name = "TOKEN")]
        token: String,

        #[arg(short, long, default_value = "1")]
        attempt: usize,
    },

    /// Print tokens heard on the default input device
    #[cfg(feature = "device")]
    Listen {
        #[arg(long, default_value = "30")]
        seconds: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let settings = Settings::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Encode { token, output, attempt } => encode_command(&settings, &token, &output, attempt)?,
        Commands::Decode { input } => decode_command(&settings, &input)?,
        Commands::Token { payment_id, hex_chars } => println!("{}", Token::from_payment_id(&payment_id, hex_chars)?),
        Commands::Simulate { payment_id, confirm_after_polls, drop_attempts } => {
            simulate_command(&settings, &payment_id, confirm_after_polls, drop_attempts).await?
        }
        Commands::Serve { bind } => server::serve(bind, InMemoryBackend::new()).await?,
        #[cfg(feature = "device")]
        Commands::Broadcast { token, attempt } => broadcast_command(&settings, &token, attempt).await?,
        #[cfg(feature = "device")]
        Commands::Listen { seconds } => listen_command(&settings, seconds).await?,
    }

    Ok(())
}

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    // Diagnostics go to stderr; stdout carries only command output
    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn encode_command(settings: &Settings, raw: &str, output: &Path, attempt: usize) -> Result<()> {
    let profile = settings.attempt(attempt)?;
    let encoder = ToneEncoder::new();
    let schedule = encoder.schedule(raw, &profile)?;
    let samples = schedule.render(encoder.sample_rate());

    wav::write_wav(output, &samples, encoder.sample_rate())?;
    tracing::info!(
        "Wrote {} tones ({:?}) to {}",
        schedule.tones().len(),
        schedule.total_duration(),
        output.display()
    );
    Ok(())
}

fn decode_command(settings: &Settings, input: &Path) -> Result<()> {
    let (samples, sample_rate) = wav::read_wav(input)?;
    tracing::info!("Read {} samples at {} Hz", samples.len(), sample_rate);

    let mut decoder = SpectralDecoder::new(settings.decoder.clone().resized_for(sample_rate))?;
    for token in decoder.push_samples(&samples)? {
        println!("{}", token);
    }

    if decoder.state() == DecoderState::InFrame {
        tracing::warn!("Input ended inside a frame: {:?}", decoder.collected());
    }
    tracing::info!("{:?}", decoder.stats());
    Ok(())
}

async fn simulate_command(
    settings: &Settings,
    payment_id: &str,
    confirm_after_polls: Option<u32>,
    drop_attempts: usize,
) -> Result<()> {
    let backend = InMemoryBackend::new();
    let reference = backend.insert(payment_id, "simulated-store", 1000)?;
    if let Some(polls) = confirm_after_polls {
        backend.settle_after_polls(payment_id, polls)?;
    }

    let (output, input) = loopback(soundpay_core::SAMPLE_RATE as u32);
    output.mute_next(drop_attempts);
    let mut speaker = Speaker::new(output);
    let mut microphone = Microphone::new(input);
    let mut stream = microphone.listen(settings.decoder.clone()).await?;
    let controller = EscalationController::new(settings.escalation.clone())?;

    let payee = async {
        while let Some(token) = stream.next().await {
            match backend.redeem(&token).await {
                Ok(payment) => {
                    tracing::info!("Payee redeemed {} for {}", token, payment.payment_id);
                    if confirm_after_polls.is_none() {
                        if let Err(e) = backend.settle(&payment.payment_id) {
                            tracing::warn!("Settlement failed: {}", e);
                        }
                    }
                }
                Err(e) => tracing::warn!("Payee could not redeem {}: {}", token, e),
            }
        }
    };
    let mut haptics = NoHaptics;
    let payer = controller.run(&mut speaker, &backend, payment_id, &reference.token, &mut haptics);

    // The payee keeps listening until the payer is done
    let outcome = tokio::select! {
        outcome = payer => outcome,
        _ = payee => return Err(CliError::Usage("payee session ended early".into())),
    };
    microphone.stop();

    match outcome? {
        EscalationOutcome::Settled { attempt, settlement } => {
            let reference = settlement.map(|s| s.transaction_ref).unwrap_or_default();
            println!("settled on attempt {} {}", attempt, reference);
        }
        other => println!("{:?}", other),
    }
    Ok(())
}

#[cfg(feature = "device")]
async fn broadcast_command(settings: &Settings, raw: &str, attempt: usize) -> Result<()> {
    let profile = settings.attempt(attempt)?;
    let token = Token::parse(raw)?;
    let mut speaker = Speaker::new(device::CpalOutput::open_default()?);
    let schedule = speaker.broadcast(&token, &profile).await?;
    tracing::info!("Broadcast {} in {:?}", token, schedule.total_duration());
    Ok(())
}

#[cfg(feature = "device")]
async fn listen_command(settings: &Settings, seconds: u64) -> Result<()> {
    let mut microphone = Microphone::new(device::CpalInput);
    let mut stream = microphone.listen(settings.decoder.clone()).await?;
    let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(seconds);

    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            break;
        }
        match stream.next_within(remaining).await {
            Ok(token) => println!("{}", token),
            Err(e) if e.is_benign() => break,
            Err(e) => {
                microphone.stop();
                return Err(e.into());
            }
        }
    }

    microphone.stop();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_simulate_flags() {
        let cli = Cli::parse_from(["soundpay", "simulate", "pm_1", "--drop-attempts", "2"]);
        match cli.command {
            Commands::Simulate { payment_id, confirm_after_polls, drop_attempts } => {
                assert_eq!(payment_id, "pm_1");
                assert_eq!(confirm_after_polls, None);
                assert_eq!(drop_attempts, 2);
            }
            _ => panic!("expected simulate"),
        }
    }

    #[test]
    fn test_global_config_flag() {
        let cli = Cli::parse_from(["soundpay", "decode", "in.wav", "--config", "c.json"]);
        assert_eq!(cli.config.as_deref(), Some(Path::new("c.json")));
    }
}
