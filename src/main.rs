use std::sync::Arc;

use anyhow::{Context, Result};
use assessment_session::{
    logging, ApiClient, AssessmentSession, AssessmentState, Config, MediaCaptureSession, Phase,
    RecordingController, Speaker, SyntheticDevices, SyntheticEncoder, TokenStore,
};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "assessment-session")]
#[command(about = "Run a headless assessment conversation against the API")]
struct Args {
    /// Config file (extension optional)
    #[arg(long, default_value = "config/assessment-session")]
    config: String,

    /// Skip camera/microphone capture
    #[arg(long)]
    no_recording: bool,

    /// Assignment to start an attempt for
    assignment_id: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let cfg = Config::load(&args.config)?;
    logging::init(&cfg.logging.level);

    info!("Assessment session v{}", env!("CARGO_PKG_VERSION"));
    info!("API: {}", cfg.api.base_url);

    let tokens = TokenStore::new(&cfg.auth.token_path).context("invalid token path")?;
    let api = ApiClient::new(&cfg.api.base_url, tokens, cfg.connect_timeout())?;

    let session = if args.no_recording {
        AssessmentSession::new(api)
    } else {
        let capture = MediaCaptureSession::new(
            Arc::new(SyntheticDevices::granting()),
            Box::new(SyntheticEncoder::new(cfg.recording.timeslice())),
        );
        let (recorder, events) = RecordingController::new(capture, cfg.recording.to_options());
        AssessmentSession::with_recorder(api, recorder, events)
    };

    let transcript = tokio::spawn(print_transcript(session.subscribe()));

    session.initialize(&args.assignment_id);
    session.grant_permissions().await?;
    session.start().await?;

    println!("Type your answers. Commands: /pause /resume /retry /continue /finish /quit");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        let result = match line {
            "" => continue,
            "/pause" => {
                session.pause_recording().await;
                Ok(())
            }
            "/resume" => {
                session.resume_recording().await;
                Ok(())
            }
            "/retry" => session.retry().await,
            "/continue" => {
                session.continue_after_closure();
                Ok(())
            }
            "/finish" => {
                let result = session.finish().await;
                if result.is_ok() {
                    break;
                }
                result
            }
            "/quit" => {
                session.abandon().await;
                break;
            }
            content => session.send_message(content).await,
        };

        if let Err(e) = result {
            warn!("{}", e);
            if e.requires_logout() {
                break;
            }
        }
    }

    let state = session.state();
    if state.phase == Phase::Completed {
        info!("Attempt complete");
    }
    drop(session);
    transcript.abort();

    Ok(())
}

/// Print each message once it stops streaming
async fn print_transcript(mut updates: watch::Receiver<AssessmentState>) {
    let mut printed = 0;
    let mut last_phase = Phase::Idle;

    loop {
        {
            let state = updates.borrow_and_update();
            if state.messages.len() < printed {
                printed = 0;
            }
            for message in state.messages[printed..].iter().take_while(|m| !m.is_streaming) {
                let who = match message.speaker {
                    Speaker::Interviewer => "interviewer",
                    Speaker::Learner => "you",
                    Speaker::System => "system",
                };
                println!("[{}] {}", who, message.content);
                printed += 1;
            }

            if state.phase != last_phase {
                last_phase = state.phase;
                match (state.phase, &state.error) {
                    (Phase::Error, Some(error)) => println!("!! {} (/retry to resend)", error),
                    (Phase::ClosureReady, _) => {
                        println!("-- The interviewer has wrapped up. /finish or /continue")
                    }
                    _ => {}
                }
            }
        }

        if updates.changed().await.is_err() {
            break;
        }
    }
}
