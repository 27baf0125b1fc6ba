// Copyright (C) 2025 Michael Wilson <mike@mdwn.dev>
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free Software
// Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//
use std::{error::Error, path::PathBuf, time::Duration};

use clap::{crate_version, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use mloop::{
    audio,
    config::{EngineConfig, Project},
    engine::Engine,
    midi,
    thread::{self, Role},
    util,
    wave::loader,
};

/// Rate waves are decoded at when checking a project that doesn't record one.
const CHECK_SAMPLE_RATE: u32 = 44100;

#[derive(Parser)]
#[clap(
    author = "Michael Wilson",
    version = crate_version!(),
    about = "A live looper."
)]
struct Cli {
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Lists the available audio devices.
    Devices {},
    /// Lists the available MIDI input/output devices.
    MidiDevices {},
    /// Verifies that a project parses and that all of its waves load.
    Check {
        /// The path to the project file.
        project_path: PathBuf,
    },
    /// Runs the engine with a project until interrupted.
    Play {
        /// The path to the engine config.
        config_path: PathBuf,
        /// The path to the project file.
        project_path: PathBuf,
        /// Start the transport right away.
        #[arg(short, long)]
        start: bool,
    },
    /// Writes an empty project.
    NewProject {
        /// Where to write the project.
        path: PathBuf,
        /// The project name. Defaults to the file name.
        #[arg(short, long)]
        name: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    thread::register(Role::Main, false);

    let cli = Cli::parse();

    match cli.command {
        Commands::Devices {} => {
            let devices = audio::list_devices()?;

            if devices.is_empty() {
                println!("No devices found.");
                return Ok(());
            }

            println!("Devices:");
            for device in devices {
                println!("- {}", device);
            }
        }
        Commands::MidiDevices {} => {
            let devices = midi::list_devices()?;

            if devices.is_empty() {
                println!("No devices found.");
                return Ok(());
            }

            println!("Devices:");
            for device in devices {
                println!("- {}", device);
            }
        }
        Commands::Check { project_path } => {
            let project = Project::deserialize(&project_path)?;
            let base = project_path
                .parent()
                .map(PathBuf::from)
                .unwrap_or_default();
            let rate = project.sample_rate.unwrap_or(CHECK_SAMPLE_RATE);

            println!(
                "{}: {} bpm, {} beats, {} channels, {} actions",
                project.name,
                project.bpm,
                project.beats,
                project.channels.len(),
                project.actions.len()
            );
            let mut broken = 0;
            for channel in &project.channels {
                println!("- {} {} ({:?})", channel.id, channel.name, channel.kind);
                for wave in channel.scenes.iter().filter_map(|scene| scene.wave.as_ref()) {
                    let path = Project::resolve(&base, wave);
                    match loader::load(&path, 0, rate) {
                        Ok(wave) => println!(
                            "  - {}: {} frames ({})",
                            util::filename_display(&path),
                            wave.frames(),
                            util::duration_minutes_seconds(Duration::from_secs_f64(
                                wave.frames() as f64 / rate as f64
                            ))
                        ),
                        Err(e) => {
                            broken += 1;
                            println!("  - {}: {}", util::filename_display(&path), e);
                        }
                    }
                }
            }

            if broken > 0 {
                return Err(format!("{} waves failed to load", broken).into());
            }
        }
        Commands::Play {
            config_path,
            project_path,
            start,
        } => {
            let config = EngineConfig::deserialize(&config_path)?;
            let mut engine = Engine::from_config(config)?;
            engine.load_project(&project_path)?;
            if start {
                engine.start()?;
            }

            info!("Running, press Ctrl-C to stop.");
            tokio::signal::ctrl_c().await?;
            engine.shutdown();
        }
        Commands::NewProject { path, name } => {
            if path.exists() {
                return Err(format!("{} already exists", path.display()).into());
            }
            let name = name.unwrap_or_else(|| {
                path.file_stem()
                    .map(|stem| stem.to_string_lossy().into_owned())
                    .unwrap_or_else(|| {
                        warn!("No file name to name the project after.");
                        String::from("untitled")
                    })
            });
            Project::new(&name).save(&path)?;
        }
    }

    Ok(())
}
