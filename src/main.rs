use std::{
    fs::{self, File},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use chrono::Local;
use tracing::{error, info, span, trace, Level};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use simperception::{
    annotated_frame_path, build_perceptor,
    config::AppConfig,
    create_output_dirs,
    output::DetectionLog,
    perception::vis::{Annotator, FrameWindow},
    sim::{scenario::Scenario, sensor::Camera, AiMode, SimClient},
};

fn main() -> Result<()> {
    init_logging("log")?;

    let span = span!(Level::TRACE, "main");
    let _enter = span.enter();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config/simperception.toml".to_string());
    trace!("Loading configuration from {config_path}...");
    let config =
        AppConfig::from_file(&config_path).context("Failed to load configuration")?;

    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = Arc::clone(&stop);
        ctrlc::set_handler(move || {
            stop.store(true, Ordering::SeqCst);
        })
        .context("Failed to install interrupt handler")?;
    }

    create_output_dirs(&config.output).context("Failed to create output directories")?;

    trace!("Building scenario description...");
    let scenario = Scenario::from_config(&config.scenario, &config.vehicle)
        .context("Failed to build scenario")?;

    let mut client =
        SimClient::connect(&config.simulator).context("Failed to connect to simulator")?;

    let mut log = DetectionLog::new();
    let run_result = run(&mut client, &config, &scenario, &mut log, &stop);

    // Whatever happened in the run, the log is flushed and the connection
    // released before the error propagates.
    if let Err(e) = log.save(&config.output.log_path) {
        error!("Failed to write detection log: {e}");
    }
    if let Err(e) = client.disconnect() {
        error!("Failed to disconnect from simulator: {e}");
    }

    run_result
}

fn run(
    client: &mut SimClient,
    config: &AppConfig,
    scenario: &Scenario,
    log: &mut DetectionLog,
    stop: &AtomicBool,
) -> Result<()> {
    client.load_scenario(scenario)?;
    client.start_scenario()?;

    if config.vehicle.traffic {
        client.set_ai_mode(&config.vehicle.id, AiMode::Traffic)?;
    }

    if !config.camera.enabled {
        info!("Camera disabled; the simulator drives the vehicle. Stop with Ctrl-C.");
        wait_for_stop(stop);
        return Ok(());
    }

    let camera = Camera::from(&config.camera);
    client.attach_camera(&config.vehicle.id, &camera)?;

    if !config.perception.enabled {
        info!("Perception disabled; camera attached but idle. Stop with Ctrl-C.");
        wait_for_stop(stop);
        return Ok(());
    }

    run_perception_loop(client, config, &camera, log, stop)
}

fn wait_for_stop(stop: &AtomicBool) {
    while !stop.load(Ordering::SeqCst) {
        thread::sleep(Duration::from_millis(200));
    }
    info!("Interrupt received.");
}

fn run_perception_loop(
    client: &mut SimClient,
    config: &AppConfig,
    camera: &Camera,
    log: &mut DetectionLog,
    stop: &AtomicBool,
) -> Result<()> {
    let perceptor = build_perceptor(&config.perception)?;

    let annotator = if config.output.display || config.output.frame_dir.is_some() {
        Some(Annotator::new(
            &config.output.font_path,
            config.output.mask_alpha,
        )?)
    } else {
        None
    };
    let window = if config.output.display {
        Some(
            FrameWindow::open("simperception", camera.resolution)
                .context("Failed to open display window")?,
        )
    } else {
        None
    };

    info!("Entering perception loop; quit with Escape or Q in the window, or Ctrl-C.");
    let start_time = Instant::now();

    loop {
        if stop.load(Ordering::SeqCst) {
            info!("Interrupt received, leaving perception loop.");
            break;
        }

        let frame = client.poll_camera(&config.vehicle.id, &camera.name)?;
        let perception = perceptor.perceive(&frame)?;
        let frame_id = log.append(&perception.objects);

        if let Some(annotator) = &annotator {
            let annotated = annotator.annotate(&frame, &perception);

            if let Some(frame_dir) = &config.output.frame_dir {
                let path = annotated_frame_path(frame_dir, frame_id);
                if let Err(e) = annotated.save(&path) {
                    error!("Failed to save annotated frame {frame_id}: {e}");
                }
            }
            if let Some(window) = &window {
                window.show(&annotated)?;
            }
        }

        if let Some(window) = &window {
            if window.quit_requested() {
                info!("Quit requested from window, leaving perception loop.");
                break;
            }
        }

        if (frame_id + 1) % 50 == 0 {
            let fps = (frame_id + 1) as f64 / start_time.elapsed().as_secs_f64();
            info!(
                "Processed {} frames ({fps:.1} FPS) | {} object(s) in current frame",
                frame_id + 1,
                perception.objects.len()
            );
        }
    }

    Ok(())
}

fn init_logging(log_dir: &str) -> Result<()> {
    if !fs::exists(log_dir)? {
        fs::create_dir_all(log_dir).context("Failed to create directory")?;
    }

    let file_name = format!(
        "{}/simperception_{}.log",
        log_dir,
        Local::now().format("%Y-%m-%d_%H-%M-%S")
    );

    let file = File::create(&file_name).context("Failed to create file")?;
    let file_appender = fmt::layer().with_writer(file).with_ansi(false);
    let file_filter = EnvFilter::new("trace");

    let console_appender = fmt::layer().with_writer(std::io::stdout).with_ansi(true);
    let console_filter = EnvFilter::new("info");

    tracing_subscriber::registry()
        .with(console_appender.with_filter(console_filter))
        .with(file_appender.with_filter(file_filter))
        .try_init()
        .context("Failed to initialize tracing subscriber")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use tempfile::tempdir;
    use tracing::trace;

    #[test]
    fn test_init_logging_creates_log_file() -> Result<()> {
        let tmp_dir = tempdir()?;
        let log_dir = tmp_dir.path().to_str().unwrap();

        init_logging(log_dir)?;

        let entries: Vec<_> = fs::read_dir(log_dir)?
            .map(|res| res.map(|e| e.path()))
            .collect::<Result<Vec<_>, std::io::Error>>()?;

        assert_eq!(entries.len(), 1);
        assert!(entries[0].to_str().unwrap().ends_with(".log"));

        trace!("This is a trace log.");

        let mut log_file = File::open(&entries[0])?;
        let mut contents = String::new();
        log_file.read_to_string(&mut contents)?;

        assert!(!contents.is_empty() && contents.contains("This is a trace log."));

        Ok(())
    }
}
