use std::fs;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use omemo_crypto::{MemoryBackend, MemoryPubSub, Omemo, Outbound};
use omemo_protocol::{Identifier, PubSubPayload, NS_DEVICELIST};
use tracing::{info, warn};

mod config;

use config::DemoConfig;

#[derive(Parser)]
#[command(
    name = "omemo-demo",
    about = "Loopback OMEMO message exchange between in-memory accounts"
)]
struct Args {
    /// Path to configuration file (TOML)
    #[arg(short, long)]
    config: Option<String>,

    /// Message sent from the sender to the recipient
    #[arg(short, long, default_value = "hello from the other side")]
    message: String,

    /// Sender account, overrides config
    #[arg(long)]
    sender: Option<String>,

    /// Recipient account, overrides config
    #[arg(long)]
    recipient: Option<String>,

    /// Number of sender devices, overrides config
    #[arg(long)]
    sender_devices: Option<u32>,

    /// Number of recipient devices, overrides config
    #[arg(long)]
    recipient_devices: Option<u32>,
}

/// All devices of one account.
struct Account {
    identifier: Identifier,
    devices: Vec<Omemo>,
}

impl Account {
    async fn register(
        hub: &MemoryPubSub,
        raw: &str,
        count: u32,
        config: &DemoConfig,
    ) -> Result<Self> {
        if count == 0 {
            bail!("{raw} needs at least one device");
        }
        let identifier: Identifier = raw
            .parse()
            .with_context(|| format!("invalid account identifier: {raw}"))?;

        let mut devices = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let mut omemo = Omemo::new(
                identifier.clone(),
                Arc::new(MemoryBackend::new()),
                Arc::new(hub.client(identifier.clone())),
                config.engine.clone(),
            );
            let device_id = omemo.prepare().await?;
            info!(
                account = %identifier,
                %device_id,
                fingerprint = %omemo.fingerprint()?,
                "device registered"
            );
            devices.push(omemo);
        }
        Ok(Self { identifier, devices })
    }
}

/// Push the published device list of `owner` to every device in `accounts`.
async fn announce(
    hub: &MemoryPubSub,
    owner: &Identifier,
    accounts: &mut [&mut Account],
) -> Result<()> {
    let Some(PubSubPayload::DeviceList { devices, .. }) = hub.item(owner, NS_DEVICELIST) else {
        bail!("{owner} has no published device list");
    };
    for account in accounts.iter_mut() {
        for omemo in account.devices.iter_mut() {
            omemo.handle_device_list_update(owner, &devices).await?;
        }
    }
    Ok(())
}

/// Decrypt `envelope` on every device that holds a key for it.
async fn deliver(
    from: &Identifier,
    outbound: &Outbound,
    receivers: &mut [&mut Omemo],
) -> Result<()> {
    let Outbound::Encrypted(envelope) = outbound else {
        warn!("message went out unencrypted");
        return Ok(());
    };
    for omemo in receivers.iter_mut() {
        let device_id = omemo.device_id()?;
        let own = omemo.own_identifier().clone();
        let text = omemo
            .decrypt_inbound(from, envelope)
            .await
            .with_context(|| format!("device {device_id} of {own} failed to decrypt"))?;
        info!(
            account = %own,
            %device_id,
            %text,
            "message decrypted"
        );
    }
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "omemo_cli=info,omemo_crypto=info".into()),
        )
        .init();

    let args = Args::parse();

    // Load config
    let mut config = if let Some(config_path) = &args.config {
        let content = fs::read_to_string(config_path)
            .with_context(|| format!("failed to read config file: {}", config_path))?;
        toml::from_str(&content)?
    } else {
        DemoConfig::default()
    };

    // CLI overrides
    if let Some(sender) = args.sender {
        config.sender = sender;
    }
    if let Some(recipient) = args.recipient {
        config.recipient = recipient;
    }
    if let Some(count) = args.sender_devices {
        config.sender_devices = count;
    }
    if let Some(count) = args.recipient_devices {
        config.recipient_devices = count;
    }

    info!(
        sender = %config.sender,
        recipient = %config.recipient,
        sender_devices = config.sender_devices,
        recipient_devices = config.recipient_devices,
        trust_policy = ?config.engine.trust_policy,
        "starting loopback exchange"
    );

    let hub = MemoryPubSub::new();
    let mut sender =
        Account::register(&hub, &config.sender, config.sender_devices, &config).await?;
    let mut recipient =
        Account::register(&hub, &config.recipient, config.recipient_devices, &config).await?;
    if sender.identifier == recipient.identifier {
        bail!("sender and recipient must be different accounts");
    }

    let sender_id = sender.identifier.clone();
    let recipient_id = recipient.identifier.clone();
    announce(&hub, &sender_id, &mut [&mut sender, &mut recipient]).await?;
    announce(&hub, &recipient_id, &mut [&mut sender, &mut recipient]).await?;

    // First message: sender's primary device to every recipient device
    // and to the sender's other devices.
    let (primary, others) = sender
        .devices
        .split_first_mut()
        .context("sender has no devices")?;
    primary.set_enabled(&recipient_id, true).await?;
    let outbound = primary.process_outbound(&recipient_id, &args.message).await?;
    if let Outbound::Encrypted(envelope) = &outbound {
        info!(keys = envelope.keys.len(), "envelope built");
    }

    let mut receivers: Vec<&mut Omemo> = recipient.devices.iter_mut().collect();
    receivers.extend(others.iter_mut());
    deliver(&sender_id, &outbound, &mut receivers).await?;

    // Reply from the recipient's primary device.
    let (reply_device, _) = recipient
        .devices
        .split_first_mut()
        .context("recipient has no devices")?;
    reply_device.set_enabled(&sender_id, true).await?;
    let reply = reply_device
        .process_outbound(&sender_id, "got it")
        .await?;
    deliver(&recipient_id, &reply, &mut [primary]).await?;

    info!("loopback exchange complete");
    Ok(())
}
