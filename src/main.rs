use anyhow::Result;
use lyria_steer::audio::{HeadlessDevice, OutputDevice};
use lyria_steer::stream::SimulatedTransport;
use lyria_steer::{ParameterDelta, Scale, SessionEvent, SteeringConfig, SteeringController, WeightedPrompt};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Sound card when there is one, otherwise a software clock
#[cfg(feature = "audio-io")]
fn output_device(headless: bool) -> Arc<dyn OutputDevice> {
    use lyria_steer::audio::{list_output_devices, CpalDevice};

    if headless {
        return Arc::new(HeadlessDevice::new());
    }
    match list_output_devices() {
        Ok(devices) if !devices.is_empty() => {
            info!("Output devices: {}", devices.join(", "));
            Arc::new(CpalDevice::new())
        }
        Ok(_) => {
            warn!("No output devices found, running headless");
            Arc::new(HeadlessDevice::new())
        }
        Err(e) => {
            warn!("Could not list output devices ({}), running headless", e);
            Arc::new(HeadlessDevice::new())
        }
    }
}

#[cfg(not(feature = "audio-io"))]
fn output_device(_headless: bool) -> Arc<dyn OutputDevice> {
    Arc::new(HeadlessDevice::new())
}

fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "lyria_steer=debug,info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting lyria-steer demo with a simulated model");

    let headless = std::env::args().any(|arg| arg == "--headless");
    let transport = SimulatedTransport::new().with_drop_after(60);
    let controller = SteeringController::builder(Arc::new(transport))
        .with_config(SteeringConfig::default())
        .with_device(output_device(headless))
        .build()?;
    let events = controller.events();

    controller.play_test_tone(0.5)?;
    std::thread::sleep(Duration::from_millis(600));

    controller.start_session()?;

    let steps = [
        ParameterDelta::new().with_bpm(90).with_density(0.3),
        ParameterDelta::new().with_scale(Scale::DMajorBMinor).with_brightness(0.8),
        ParameterDelta::new().with_prompts(vec![
            WeightedPrompt::new("Minimal techno", 0.7),
            WeightedPrompt::new("Rain", 0.3),
        ]),
        ParameterDelta::new().with_bpm(250),
        ParameterDelta::new().with_density(0.9).with_guidance(5.0),
    ];

    for step in steps {
        std::thread::sleep(Duration::from_secs(2));
        match controller.update_parameters(step) {
            Ok(revision) => info!("Applied revision {}", revision),
            Err(e) => warn!("{}", e.user_message()),
        }

        for event in events.try_iter() {
            if let SessionEvent::SessionLost(reason) = event {
                warn!("Session lost: {}", reason);
            }
        }
        info!("{}", controller.telemetry().summary());
    }

    // Long enough for the simulated model to drop and the session to recover
    std::thread::sleep(Duration::from_secs(5));
    info!("{}", controller.telemetry().summary());

    controller.reset_context();
    std::thread::sleep(Duration::from_secs(1));
    controller.stop_session();

    info!("Final: {}", controller.telemetry().summary());
    Ok(())
}
