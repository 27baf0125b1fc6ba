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
//! Project load and save.

use std::{
    collections::HashSet,
    path::{Path, PathBuf},
    sync::Arc,
};

use tracing::{info, warn};

use super::{Core, EngineError};
use crate::{
    config::{ChannelDescription, Project, SceneDescription},
    model::{
        channel::{Channel, ChannelKind, ChannelStatus, ChannelType, Scene, MASTER_ID},
        Model, Shared,
    },
    sequencer::SequencerShared,
    wave::{loader, writer, Wave, WaveStore},
};

impl Core {
    /// Replaces the whole session with the project at `path`. The new model
    /// is built aside and swapped in with a single edit. Waves that fail to
    /// load leave their channel MISSING or WRONG instead of failing the load.
    pub fn load_project(&self, path: &Path) -> Result<(), EngineError> {
        let _enter = self.span.enter();
        let project = Project::deserialize(path)?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));

        // Sequencer settings go to a detached cell until the swap.
        let staging = Shared {
            sequencer: Arc::new(SequencerShared::default()),
            mixer: self.shared.mixer.clone(),
        };
        let mut model = Model::new(
            self.sample_rate,
            self.frames,
            self.config.behaviors(),
            &staging,
        );
        model.name = project.name.clone();
        model.sequencer.set_beats(project.beats, project.bars);
        model.set_bpm(project.bpm);
        model.sequencer.set_quantize(project.quantize);
        model.master().shared.set_volume(project.volume_out);

        for description in &project.channels {
            if model.channel(description.id).is_some() {
                warn!(channel = description.id, "Duplicate channel id, skipped.");
                continue;
            }
            let Some(channel) = self.build_channel(&mut model.waves, base, description) else {
                warn!(channel = description.id, kind = ?description.kind, "Channel kind can't be loaded, skipped.");
                continue;
            };
            model.add_channel(channel);
        }

        let groups: HashSet<_> = model
            .user_channels()
            .filter(|channel| channel.channel_type() == ChannelType::Group)
            .map(|channel| channel.id)
            .collect();
        for channel in model.channels.iter_mut() {
            if let Some(group) = channel.group {
                if !groups.contains(&group) {
                    warn!(channel = channel.id, group, "Unknown group, routed to master.");
                    channel.group = None;
                }
            }
        }

        let known: HashSet<_> = model.channels.iter().map(|channel| channel.id).collect();
        for action in &project.actions {
            if known.contains(&action.channel) {
                model.actions.record(*action);
            }
        }
        if let Some(rate) = project.sample_rate {
            if rate != self.sample_rate && rate > 0 {
                model.actions.rescale(self.sample_rate as f64 / rate as f64);
            }
        }
        model.actions.shrink(model.sequencer.frames_in_loop());
        model.refresh_has_actions();

        let ctx = model.play_context();
        for description in project.channels.iter().filter(|d| d.read_actions) {
            if let Some(player) = model
                .channel_mut(description.id)
                .and_then(Channel::sample_player_mut)
            {
                player.toggle_read_actions(&ctx);
            }
        }
        for channel in &model.channels {
            channel.publish();
        }

        let solos = model.count_solos();
        let channels = model.user_channels().count();
        let bpm = model.sequencer.bpm();
        let mixer = &self.shared.mixer;
        let old = self.store.replace(model, |model| {
            model.sequencer.attach_shared(self.shared.sequencer.clone());
            mixer.set_input_recording(false);
            mixer.arm_signal(false);
            mixer.set_solo_count(solos);
            mixer.set_metronome(project.metronome);
            mixer.set_in_volume(project.volume_in);
        })?;
        drop(old);

        info!(
            path = %path.display(),
            name = project.name,
            channels,
            actions = project.actions.len(),
            bpm,
            "Loaded project."
        );
        Ok(())
    }

    /// Writes the session to `path`. Waves recorded in this session are
    /// written next to it as WAV files, other waves are referenced where
    /// they were loaded from.
    pub fn save_project(&self, path: &Path) -> Result<(), EngineError> {
        let _enter = self.span.enter();
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        let mixer = &self.shared.mixer;

        // Collect under the read and write files after it, so playback is
        // only paused for the copy.
        let (project, takes) = self.store.read(|model| {
            let mut takes: Vec<(Arc<Wave>, PathBuf)> = Vec::new();
            let mut project = Project::new(&model.name);
            project.bpm = model.sequencer.bpm();
            project.beats = model.sequencer.beats();
            project.bars = model.sequencer.bars();
            project.quantize = model.sequencer.quantize();
            project.metronome = mixer.metronome();
            project.volume_out = model.master().shared.volume();
            project.volume_in = mixer.in_volume();
            project.sample_rate = Some(model.sample_rate());
            project.actions = model.actions.iter().copied().collect();
            project.channels = model
                .user_channels()
                .map(|channel| describe(channel, base, &mut takes))
                .collect();
            (project, takes)
        })?;

        for (wave, file) in &takes {
            writer::save(wave, &base.join(file))?;
        }
        project.save(path)?;
        info!(
            path = %path.display(),
            takes = takes.len(),
            "Saved session."
        );
        Ok(())
    }

    fn build_channel(
        &self,
        waves: &mut WaveStore,
        base: &Path,
        description: &ChannelDescription,
    ) -> Option<Channel> {
        let (id, name, frames) = (description.id, description.name.as_str(), self.frames);
        let mut channel = match description.kind {
            ChannelType::Sample => Channel::sample(id, name, description.mode, frames),
            ChannelType::Midi => Channel::midi(id, name, description.midi_channel, frames),
            ChannelType::Group => Channel::group(id, name, frames),
            ChannelType::Master | ChannelType::Preview => return None,
        };
        if let Some(player) = channel.sample_player_mut() {
            let mut failed = None;
            let scenes = description
                .scenes
                .iter()
                .enumerate()
                .map(|(index, scene)| match self.load_scene(waves, base, scene) {
                    Ok(scene) => scene,
                    Err(status) => {
                        if index == description.active_scene {
                            failed = Some(status);
                        }
                        Scene::default()
                    }
                })
                .collect();
            player.set_scenes(scenes, description.active_scene);
            if let Some(status) = failed {
                player.set_error(status);
            }
        }

        let shared = &channel.shared;
        shared.set_volume(description.volume);
        shared.set_pan(description.pan);
        shared.set_pitch(description.pitch);
        shared.set_boost_db(description.boost);
        shared.set_mute(description.mute);
        shared.swap_solo(description.solo);
        shared.set_armed(description.armed);
        shared.set_velocity_as_vol(description.velocity_as_vol);
        channel.group = description.group;
        channel.learn = description.learn.clone();
        channel.lightning = description.lightning.clone();
        Some(channel)
    }

    fn load_scene(
        &self,
        waves: &mut WaveStore,
        base: &Path,
        description: &SceneDescription,
    ) -> Result<Scene, ChannelStatus> {
        let Some(file) = &description.wave else {
            return Ok(Scene::default());
        };
        let path = Project::resolve(base, file);
        let wave = loader::load(&path, waves.next_id(), self.sample_rate).map_err(|e| {
            warn!(path = %path.display(), err = %e, "Unable to load scene wave.");
            ChannelStatus::from(&e)
        })?;
        let mut scene = Scene::with_wave(waves.insert(wave));
        scene.set_range(description.begin, description.end.unwrap_or(scene.end));
        scene.shift = description.shift;
        scene.pitch = description.pitch;
        Ok(scene)
    }
}

fn describe(
    channel: &Channel,
    base: &Path,
    takes: &mut Vec<(Arc<Wave>, PathBuf)>,
) -> ChannelDescription {
    let mut description = ChannelDescription::new(channel.id, &channel.name, channel.channel_type());
    let shared = &channel.shared;
    description.group = channel.group;
    description.volume = shared.volume();
    description.pan = shared.pan();
    description.pitch = shared.pitch();
    description.boost = shared.boost_db();
    description.mute = shared.is_muted();
    description.solo = shared.is_soloed();
    description.armed = shared.is_armed();
    description.velocity_as_vol = shared.velocity_as_vol();
    description.learn = channel.learn.clone();
    description.lightning = channel.lightning.clone();

    match &channel.kind {
        ChannelKind::Sample(player) => {
            description.mode = player.mode();
            description.read_actions = player.is_reading_actions();
            description.active_scene = player.active_scene();
            description.scenes = player
                .scenes()
                .iter()
                .map(|scene| SceneDescription {
                    wave: scene.wave.as_ref().map(|wave| wave_path(wave, base, takes)),
                    begin: scene.begin,
                    end: Some(scene.end),
                    shift: scene.shift,
                    pitch: scene.pitch,
                })
                .collect();
        }
        ChannelKind::Midi(player) => description.midi_channel = player.midi_channel(),
        _ => {}
    }
    description
}

/// Where the project refers to a wave. Recorded waves get a file next to the
/// project, the same wave only once.
fn wave_path(wave: &Arc<Wave>, base: &Path, takes: &mut Vec<(Arc<Wave>, PathBuf)>) -> PathBuf {
    match wave.path() {
        Some(path) if !wave.is_logical() => path
            .strip_prefix(base)
            .map(Path::to_path_buf)
            .unwrap_or_else(|_| path.to_path_buf()),
        _ => {
            let file = PathBuf::from(format!("{}.wav", wave.name()));
            if !takes.iter().any(|(taken, _)| Arc::ptr_eq(taken, wave)) {
                takes.push((wave.clone(), file.clone()));
            }
            file
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{Audio, Behaviors, EngineConfig, Midi},
        engine::Engine,
        midi::learn::Binding,
        model::{
            actions::{Action, ActionKind},
            channel::PlayMode,
        },
        testutil::{register_main, write_wav},
    };

    const RATE: u32 = 44100;

    fn start_engine() -> Engine {
        register_main();
        let config = EngineConfig::new(Audio::new("mock-device"), Midi::default(), Behaviors::default());
        let audio = crate::audio::get_device(config.audio()).unwrap();
        Engine::new(config, audio, None).unwrap()
    }

    fn sample_file(dir: &Path, name: &str, frames: usize) -> PathBuf {
        let path = dir.join(name);
        write_wav(path.clone(), vec![vec![0.25f32; frames], vec![0.25f32; frames]], RATE).unwrap();
        path
    }

    #[test]
    fn test_load_project() {
        let engine = start_engine();
        let dir = tempfile::tempdir().unwrap();
        sample_file(dir.path(), "kick.wav", 1000);

        let mut project = Project::new("live");
        project.bpm = 100.0;
        project.volume_out = 0.5;
        project.metronome = true;
        let mut kick = ChannelDescription::new(3, "kick", ChannelType::Sample);
        kick.mode = PlayMode::LoopBasic;
        kick.solo = true;
        kick.group = Some(9);
        kick.scenes.push(SceneDescription::new(Some(PathBuf::from("kick.wav"))));
        kick.scenes.push(SceneDescription::new(Some(PathBuf::from("gone.wav"))));
        project.channels.push(kick);
        let mut pads = ChannelDescription::new(4, "pads", ChannelType::Midi);
        pads.midi_channel = 2;
        pads.learn.key_press = Some(Binding {
            status: 0x90,
            data1: 36,
        });
        project.channels.push(pads);
        project.channels.push(ChannelDescription::new(3, "again", ChannelType::Group));
        project.actions.push(Action {
            channel: 3,
            frame: 100,
            kind: ActionKind::KeyPress,
        });
        project.actions.push(Action {
            channel: 42,
            frame: 100,
            kind: ActionKind::KeyPress,
        });
        let path = dir.path().join("live.yaml");
        project.save(&path).unwrap();

        engine.load_project(&path).unwrap();

        assert_eq!(engine.sequencer().bpm(), 100.0);
        assert!(engine.mixer().metronome());
        assert_eq!(engine.mixer().solo_count(), 1);
        let kick = engine.handle(3).unwrap();
        assert_eq!(kick.name, "kick");
        assert_eq!(kick.group, None);
        assert_eq!(kick.shared.status(), ChannelStatus::Off);
        assert!(engine.handle(4).unwrap().learn.key_press.is_some());
        assert_eq!(engine.handles().len(), 4);
        assert_eq!(engine.handle(MASTER_ID).unwrap().shared.volume(), 0.5);

        engine
            .store()
            .read(|model| {
                assert_eq!(model.name, "live");
                assert_eq!(model.actions.len(), 1);
                let player = model.channel(3).and_then(Channel::sample_player).unwrap();
                assert_eq!(player.scenes().len(), 2);
                assert!(player.scenes()[0].has_wave());
                assert!(!player.scenes()[1].has_wave());
                assert!(player.has_actions());
            })
            .unwrap();
    }

    #[test]
    fn test_reload_moves_transport_and_solo_state_together() {
        let engine = start_engine();
        let dir = tempfile::tempdir().unwrap();
        sample_file(dir.path(), "kick.wav", 1000);

        let mut first = Project::new("first");
        first.bpm = 100.0;
        let mut kick = ChannelDescription::new(3, "kick", ChannelType::Sample);
        kick.solo = true;
        kick.scenes.push(SceneDescription::new(Some(PathBuf::from("kick.wav"))));
        first.channels.push(kick);
        let first_path = dir.path().join("first.yaml");
        first.save(&first_path).unwrap();

        let mut second = Project::new("second");
        second.bpm = 140.0;
        second.quantize = 2;
        second.channels.push(ChannelDescription::new(3, "kick", ChannelType::Sample));
        let second_path = dir.path().join("second.yaml");
        second.save(&second_path).unwrap();

        engine.load_project(&first_path).unwrap();
        assert_eq!(engine.sequencer().bpm(), 100.0);
        assert_eq!(engine.mixer().solo_count(), 1);

        engine.load_project(&second_path).unwrap();
        assert_eq!(engine.sequencer().bpm(), 140.0);
        assert_eq!(engine.sequencer().quantize(), 2);
        assert_eq!(engine.mixer().solo_count(), 0);
        let frames_in_loop = engine
            .store()
            .read(|model| model.sequencer.frames_in_loop())
            .unwrap();
        assert_eq!(engine.sequencer().frames_in_loop(), frames_in_loop);
    }

    #[test]
    fn test_missing_active_scene_marks_the_channel() {
        let engine = start_engine();
        let dir = tempfile::tempdir().unwrap();
        let mut project = Project::new("broken");
        let mut channel = ChannelDescription::new(3, "gone", ChannelType::Sample);
        channel.scenes.push(SceneDescription::new(Some(PathBuf::from("gone.wav"))));
        project.channels.push(channel);
        let path = dir.path().join("broken.yaml");
        project.save(&path).unwrap();

        engine.load_project(&path).unwrap();
        assert_eq!(engine.status(3).unwrap(), ChannelStatus::Missing);
    }

    #[test]
    fn test_missing_project_file() {
        let engine = start_engine();
        let err = engine.load_project(Path::new("/not/here.yaml")).unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
    }

    #[test]
    fn test_save_then_load() {
        let engine = start_engine();
        let dir = tempfile::tempdir().unwrap();
        let kick = sample_file(dir.path(), "kick.wav", 2000);

        let id = engine.add_channel(ChannelType::Sample, "kick").unwrap();
        engine.load_wave(id, &kick).unwrap();
        engine.set_range(id, 100, 1500).unwrap();
        engine.set_volume(id, 0.3).unwrap();
        engine.set_bpm(90.0).unwrap();
        let take = engine.add_channel(ChannelType::Sample, "take").unwrap();
        engine
            .store()
            .edit(|model| {
                let wave = model.waves.next_id();
                let wave = model
                    .waves
                    .insert(Wave::logical(wave, vec![0.1; 800], RATE));
                model
                    .channel_mut(take)
                    .and_then(Channel::sample_player_mut)
                    .unwrap()
                    .set_wave(Some(wave));
            })
            .unwrap();

        let path = dir.path().join("session.yaml");
        engine.save_project(&path).unwrap();

        let saved = Project::deserialize(&path).unwrap();
        assert_eq!(saved.bpm, 90.0);
        assert_eq!(saved.sample_rate, Some(RATE));
        let kick = &saved.channels[0];
        assert_eq!(kick.volume, 0.3);
        assert_eq!(kick.scenes[0].wave, Some(PathBuf::from("kick.wav")));
        assert_eq!(kick.scenes[0].begin, 100);
        assert_eq!(kick.scenes[0].end, Some(1500));
        let file = saved.channels[1].scenes[0].wave.clone().unwrap();
        assert!(dir.path().join(&file).exists());

        drop(engine);
        let restored = start_engine();
        restored.load_project(&path).unwrap();
        assert_eq!(restored.sequencer().bpm(), 90.0);
        assert_eq!(restored.status(id).unwrap(), ChannelStatus::Off);
        assert_eq!(restored.status(take).unwrap(), ChannelStatus::Off);
        assert_eq!(restored.handle(id).unwrap().shared.volume(), 0.3);
    }
}
