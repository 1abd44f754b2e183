use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use harmoniq_fx_bridge::{BridgeConfig, EffectRegistry, LoopbackChannel, EQUALIZER};
use harmoniq_fx_client::{
    callback_fn, decode_parameters, EffectConfig, EffectError, EffectHandle, EffectRequest,
    EngineEvent, ParamId, ParamValue,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about = "Walk several clients through a shared effect engine")]
struct Cli {
    /// Number of clients attaching to the same equalizer.
    #[arg(long, default_value_t = 3)]
    clients: usize,
    /// Frames to process once the engine is enabled.
    #[arg(long, default_value_t = 256)]
    frames: u32,
    /// Optional bridge limits (JSON).
    #[arg(long)]
    config: Option<PathBuf>,
}

fn load_config(path: Option<&PathBuf>) -> Result<BridgeConfig> {
    let Some(path) = path else {
        return Ok(BridgeConfig::default());
    };
    let data = fs::read_to_string(path)
        .with_context(|| format!("failed to read bridge config {}", path.display()))?;
    serde_json::from_str(&data)
        .with_context(|| format!("{} is not a valid bridge config", path.display()))
}

fn describe(client: usize, event: &EngineEvent) {
    match event {
        EngineEvent::ParameterChanged { payload } => match decode_parameters(payload) {
            Ok(entries) => {
                for (id, value) in entries {
                    println!("client {client}: parameter {} -> {:?}", id.0, value.as_i32());
                }
            }
            Err(err) => println!("client {client}: undecodable parameter payload ({err})"),
        },
        EngineEvent::Error { code } => match EffectError::from_status(*code) {
            Some(err) => println!("client {client}: engine error {code} ({err})"),
            None => println!("client {client}: engine error {code}"),
        },
        other => println!("client {client}: {other:?}"),
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init()
        .ok();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref())?;
    let channel = LoopbackChannel::start(config, EffectRegistry::stock())?;

    let mut handles = Vec::with_capacity(cli.clients);
    for client in 0..cli.clients {
        let handle = EffectHandle::with_callback(
            channel.clone(),
            EffectConfig::default(),
            callback_fn(move |event| describe(client, event)),
        );
        let request = EffectRequest::for_type(EQUALIZER)
            .with_priority(client as i32)
            .with_frames_processed();
        handle
            .init(&request)
            .with_context(|| format!("client {client} failed to attach"))?;
        channel.sync();
        info!(client, controlling = handle.has_control(), "client attached");
        handles.push(Arc::new(handle));
    }

    let Some(controller) = handles.iter().find(|handle| handle.has_control()).cloned() else {
        println!("no client attached");
        return Ok(());
    };
    controller.set_parameter_deferred(ParamId(1), ParamValue::from_i32(-300))?;
    controller.set_parameter_deferred(ParamId(3), ParamValue::from_i32(450))?;
    controller.commit_parameters()?;
    controller.set_enabled(true)?;
    channel.sync();

    if let Some(instance) = controller.id() {
        channel.process_frames(instance, cli.frames)?;
        channel.sync();
    }

    drop(controller);
    if let Some(top) = handles.pop() {
        top.detach();
        channel.sync();
    }
    if let Some(next) = handles.iter().find(|handle| handle.has_control()) {
        println!(
            "control moved to {}",
            next.attachment().map(|id| id.to_string()).unwrap_or_default()
        );
        if let Some(instance) = next.id() {
            channel.kill_instance(instance)?;
            channel.sync();
        }
    }
    for handle in &handles {
        println!("{handle:?}");
    }
    Ok(())
}
