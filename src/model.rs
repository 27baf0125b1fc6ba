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
//! The engine model and the store that hands it between threads.
//!
//! All state the render thread mutates lives in one [Model]. The model is
//! never shared: it sits in a single slot, the render thread takes it out at
//! the start of a callback and puts it back at the end. A structural edit
//! disables the slot, waits until the model is back in it, takes it, mutates
//! it, returns it and enables the slot again. The render thread therefore
//! either sees the model before an edit or after it, never in between.
//!
//! Scalar controls that may change at any time live in atomics reachable
//! through [ChannelHandle] and the shared transport and mixer cells, and
//! never require a pause.

use std::{
    mem,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    thread as std_thread,
    time::{Duration, Instant},
};

use arc_swap::ArcSwap;
use crossbeam_channel::{bounded, Receiver, Sender, TryRecvError};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::{
    config::Behaviors,
    midi::learn::{ChannelLearn, Lightning},
    mixer::{Mixer, MixerShared},
    render::PlayContext,
    sequencer::{Sequencer, SequencerShared},
    thread,
    wave::WaveStore,
};

pub mod actions;
pub mod atomic;
pub mod channel;

use actions::Actions;
use channel::{Channel, ChannelId, ChannelShared, ChannelType, FIRST_USER_ID, MASTER_ID, PREVIEW_ID};

/// A position in frames.
pub type Frame = usize;

/// How long an edit waits for the render thread to hand the model back.
pub const DEFAULT_EDIT_TIMEOUT: Duration = Duration::from_secs(2);

const POLL_INTERVAL: Duration = Duration::from_micros(100);

#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("the model was not handed back within {0:?}")]
    Unavailable(Duration),
}

/// Cells that outlive any single model, so observers keep reading the same
/// values across project loads.
#[derive(Clone, Debug, Default)]
pub struct Shared {
    pub sequencer: Arc<SequencerShared>,
    pub mixer: Arc<MixerShared>,
}

/// Everything the render thread touches.
#[derive(Debug)]
pub struct Model {
    pub name: String,
    /// Master and preview always come first, in that order.
    pub channels: Vec<Channel>,
    pub sequencer: Sequencer,
    pub actions: Actions,
    pub mixer: Mixer,
    pub waves: WaveStore,
    pub behaviors: Behaviors,
    frames: usize,
    next_channel_id: ChannelId,
}

impl Model {
    pub fn new(sample_rate: u32, frames: usize, behaviors: Behaviors, shared: &Shared) -> Model {
        Model {
            name: String::new(),
            channels: vec![Channel::master(frames), Channel::preview(frames)],
            sequencer: Sequencer::with_shared(sample_rate, shared.sequencer.clone()),
            actions: Actions::new(),
            mixer: Mixer::new(frames, shared.mixer.clone()),
            waves: WaveStore::new(),
            behaviors,
            frames,
            next_channel_id: FIRST_USER_ID,
        }
    }

    /// Block size every buffer in the model is allocated for.
    pub fn frames(&self) -> usize {
        self.frames
    }

    pub fn sample_rate(&self) -> u32 {
        self.sequencer.sample_rate()
    }

    /// Hands out a fresh channel id.
    pub fn next_channel_id(&mut self) -> ChannelId {
        let id = self.next_channel_id;
        self.next_channel_id += 1;
        id
    }

    /// Adds a user channel. Its id must not be taken.
    pub fn add_channel(&mut self, channel: Channel) -> ChannelId {
        let id = channel.id;
        self.next_channel_id = self.next_channel_id.max(id + 1);
        self.channels.push(channel);
        id
    }

    /// Removes a user channel along with its recorded actions. Channels routed
    /// through a removed group go straight to master.
    pub fn remove_channel(&mut self, id: ChannelId) -> Option<Channel> {
        if id == MASTER_ID || id == PREVIEW_ID {
            return None;
        }
        let index = self.channels.iter().position(|channel| channel.id == id)?;
        let channel = self.channels.remove(index);
        self.actions.remove_channel(id);
        for other in &mut self.channels {
            if other.group == Some(id) {
                other.group = None;
            }
        }
        if channel.shared.is_soloed() {
            self.mixer.shared().remove_solo();
        }
        Some(channel)
    }

    pub fn channel(&self, id: ChannelId) -> Option<&Channel> {
        self.channels.iter().find(|channel| channel.id == id)
    }

    pub fn channel_mut(&mut self, id: ChannelId) -> Option<&mut Channel> {
        self.channels.iter_mut().find(|channel| channel.id == id)
    }

    pub fn master(&self) -> &Channel {
        &self.channels[0]
    }

    pub fn preview(&self) -> &Channel {
        &self.channels[1]
    }

    pub fn preview_mut(&mut self) -> &mut Channel {
        &mut self.channels[1]
    }

    /// Channels created by the user, in order.
    pub fn user_channels(&self) -> impl Iterator<Item = &Channel> {
        self.channels.iter().skip(2)
    }

    /// Counts soloed channels from scratch.
    pub fn count_solos(&self) -> u32 {
        self.user_channels()
            .filter(|channel| channel.shared.is_soloed())
            .count() as u32
    }

    pub fn set_buffer_frames(&mut self, frames: usize) {
        self.frames = frames;
        self.mixer.set_buffer_frames(frames);
        for channel in &mut self.channels {
            channel.set_buffer_frames(frames);
        }
    }

    /// Sets the tempo and moves recorded actions along with it.
    pub fn set_bpm(&mut self, bpm: f32) {
        let ratio = self.sequencer.set_bpm(bpm);
        if ratio != 1.0 {
            self.actions.rescale(ratio);
            self.actions.shrink(self.sequencer.frames_in_loop());
        }
    }

    /// Sets the loop length, dropping actions past the new end.
    pub fn set_beats(&mut self, beats: u32, bars: u32) {
        self.sequencer.set_beats(beats, bars);
        self.actions.shrink(self.sequencer.frames_in_loop());
        self.refresh_has_actions();
    }

    /// Recomputes every frame count for a new device sample rate.
    pub fn recompute_frames(&mut self, sample_rate: u32) {
        let ratio = self.sequencer.recompute_frames(sample_rate);
        if ratio != 1.0 {
            self.actions.rescale(ratio);
        }
    }

    /// Tells every sample channel whether it still has recorded actions.
    pub fn refresh_has_actions(&mut self) {
        let Model {
            channels, actions, ..
        } = self;
        for channel in channels.iter_mut() {
            let has_actions = actions.has_actions(channel.id);
            if let Some(player) = channel.sample_player_mut() {
                player.set_has_actions(has_actions);
            }
        }
    }

    pub fn play_context(&self) -> PlayContext {
        PlayContext {
            running: self.sequencer.is_running(),
            quantize: self.sequencer.quantize() > 0,
            treat_recs_as_loops: self.behaviors.treat_recs_as_loops,
            chans_stop_on_seq_halt: self.behaviors.chans_stop_on_seq_halt,
        }
    }

    /// Lightweight handles to every channel, for threads that only touch
    /// scalar controls.
    pub fn handles(&self) -> Vec<ChannelHandle> {
        self.channels.iter().map(ChannelHandle::from).collect()
    }
}

/// What non-render threads know about a channel without pausing playback.
#[derive(Clone, Debug)]
pub struct ChannelHandle {
    pub id: ChannelId,
    pub name: String,
    pub channel_type: ChannelType,
    pub group: Option<ChannelId>,
    pub shared: Arc<ChannelShared>,
    pub learn: ChannelLearn,
    pub lightning: Lightning,
}

impl From<&Channel> for ChannelHandle {
    fn from(channel: &Channel) -> ChannelHandle {
        ChannelHandle {
            id: channel.id,
            name: channel.name.clone(),
            channel_type: channel.channel_type(),
            group: channel.group,
            shared: channel.shared.clone(),
            learn: channel.learn.clone(),
            lightning: channel.lightning.clone(),
        }
    }
}

/// Owns the model and implements the pause/exclusive-edit protocol.
pub struct ModelStore {
    // Neither side ever blocks on the slot, so try operations stay lock free.
    slot_tx: Sender<Box<Model>>,
    slot_rx: Receiver<Box<Model>>,
    enabled: AtomicBool,
    edit_lock: Mutex<()>,
    version: AtomicU64,
    handles: ArcSwap<Vec<ChannelHandle>>,
    timeout: Duration,
}

impl ModelStore {
    pub fn new(model: Model) -> ModelStore {
        ModelStore::with_timeout(model, DEFAULT_EDIT_TIMEOUT)
    }

    pub fn with_timeout(model: Model, timeout: Duration) -> ModelStore {
        let (slot_tx, slot_rx) = bounded(1);
        let handles = ArcSwap::from_pointee(model.handles());
        // The slot is empty and has room for exactly one model.
        let _ = slot_tx.try_send(Box::new(model));
        ModelStore {
            slot_tx,
            slot_rx,
            enabled: AtomicBool::new(true),
            edit_lock: Mutex::new(()),
            version: AtomicU64::new(0),
            handles,
            timeout,
        }
    }

    // Render side.

    /// Takes the model for one callback. Returns None while disabled or while
    /// an edit holds it; the callback should then output silence.
    pub fn acquire(&self) -> Option<Box<Model>> {
        if !self.enabled.load(Ordering::Acquire) {
            return None;
        }
        self.slot_rx.try_recv().ok()
    }

    /// Puts the model back after a callback.
    pub fn release(&self, model: Box<Model>) {
        if let Err(e) = self.slot_tx.try_send(model) {
            // Only one model exists, so the slot can't be full. Never free
            // it here either way.
            mem::forget(e.into_inner());
        }
    }

    // Everything else.

    /// Parks the render path. Callbacks produce silence until [ModelStore::enable].
    pub fn disable(&self) {
        self.enabled.store(false, Ordering::Release);
    }

    pub fn enable(&self) {
        self.enabled.store(true, Ordering::Release);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Bumped after every structural edit.
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// Channel handles as of the last structural edit.
    pub fn handles(&self) -> Arc<Vec<ChannelHandle>> {
        self.handles.load_full()
    }

    pub fn handle(&self, id: ChannelId) -> Option<ChannelHandle> {
        self.handles.load().iter().find(|handle| handle.id == id).cloned()
    }

    /// Runs a structural edit with exclusive access to the model.
    pub fn edit<R>(&self, f: impl FnOnce(&mut Model) -> R) -> Result<R, ModelError> {
        thread::assert_not_realtime();
        let _guard = self.edit_lock.lock();
        let mut model = self.take()?;
        let result = f(&mut model);
        self.handles.store(Arc::new(model.handles()));
        self.put(model);
        self.version.fetch_add(1, Ordering::AcqRel);
        Ok(result)
    }

    /// Like [ModelStore::edit], for reads that need the full model.
    pub fn read<R>(&self, f: impl FnOnce(&Model) -> R) -> Result<R, ModelError> {
        thread::assert_not_realtime();
        let _guard = self.edit_lock.lock();
        let model = self.take()?;
        let result = f(&model);
        self.put(model);
        Ok(result)
    }

    /// Swaps in a model built off to the side and returns the old one, so it
    /// is dropped on the calling thread. `install` runs while rendering is
    /// paused, after the old model is out, for state that lives outside the
    /// model and must change together with it.
    pub fn replace(
        &self,
        model: Model,
        install: impl FnOnce(&mut Model),
    ) -> Result<Box<Model>, ModelError> {
        thread::assert_not_realtime();
        let _guard = self.edit_lock.lock();
        let old = self.take()?;
        let mut model = Box::new(model);
        install(&mut model);
        self.handles.store(Arc::new(model.handles()));
        self.put(model);
        self.version.fetch_add(1, Ordering::AcqRel);
        Ok(old)
    }

    fn take(&self) -> Result<Box<Model>, ModelError> {
        self.disable();
        let deadline = Instant::now() + self.timeout;
        loop {
            match self.slot_rx.try_recv() {
                Ok(model) => return Ok(model),
                Err(TryRecvError::Empty) if Instant::now() < deadline => {
                    std_thread::sleep(POLL_INTERVAL)
                }
                Err(_) => {
                    warn!(timeout = ?self.timeout, "Model was not handed back, edit abandoned.");
                    self.enable();
                    return Err(ModelError::Unavailable(self.timeout));
                }
            }
        }
    }

    fn put(&self, model: Box<Model>) {
        if self.slot_tx.try_send(model).is_err() {
            debug!("Model slot unexpectedly full.");
        }
        self.enable();
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicBool, AtomicUsize, Ordering},
            Arc,
        },
        thread as std_thread,
        time::Duration,
    };

    use super::*;
    use crate::{
        model::channel::PlayMode,
        testutil,
        thread::{self, Role},
    };

    fn model() -> Model {
        Model::new(44100, 64, Behaviors::default(), &Shared::default())
    }

    #[test]
    fn test_new_model_has_master_and_preview() {
        let model = model();
        assert_eq!(model.master().id, MASTER_ID);
        assert_eq!(model.preview().id, PREVIEW_ID);
        assert_eq!(model.user_channels().count(), 0);
    }

    #[test]
    fn test_add_and_remove_channels() {
        let mut model = model();
        let group_id = model.next_channel_id();
        model.add_channel(Channel::group(group_id, "drums", 64));
        let id = model.next_channel_id();
        let mut channel = Channel::sample(id, "kick", PlayMode::SingleBasic, 64);
        channel.group = Some(group_id);
        model.add_channel(channel);

        assert!(model.remove_channel(MASTER_ID).is_none());
        assert!(model.remove_channel(group_id).is_some());
        assert_eq!(model.channel(id).and_then(|c| c.group), None);
        assert_eq!(model.next_channel_id(), id + 1);
    }

    #[test]
    fn test_edit_bumps_version_and_handles() {
        testutil::register_main();
        let store = ModelStore::new(model());
        let id = store
            .edit(|model| {
                let id = model.next_channel_id();
                model.add_channel(Channel::sample(id, "loop", PlayMode::LoopBasic, 64))
            })
            .unwrap();
        assert_eq!(store.version(), 1);
        assert_eq!(store.handle(id).map(|h| h.name), Some("loop".to_string()));
        assert_eq!(store.handles().len(), 3);

        let count = store.read(|model| model.user_channels().count()).unwrap();
        assert_eq!(count, 1);
        assert_eq!(store.version(), 1);
    }

    #[test]
    fn test_replace_installs_before_the_new_model_is_visible() {
        testutil::register_main();
        let store = ModelStore::new(model());
        let mut rebuilt = model();
        let id = rebuilt.next_channel_id();
        rebuilt.add_channel(Channel::sample(id, "loaded", PlayMode::LoopBasic, 64));

        let old = store
            .replace(rebuilt, |model| {
                assert!(store.acquire().is_none());
                assert_eq!(store.handles().len(), 2);
                assert_eq!(store.version(), 0);
                model.name = "installed".to_string();
            })
            .unwrap();
        assert_eq!(old.user_channels().count(), 0);
        assert_eq!(store.version(), 1);
        assert_eq!(store.handles().len(), 3);
        assert_eq!(store.read(|model| model.name.clone()).unwrap(), "installed");
    }

    #[test]
    fn test_disabled_store_hands_out_nothing() {
        testutil::register_main();
        let store = ModelStore::new(model());
        store.disable();
        assert!(store.acquire().is_none());
        store.enable();
        let model = store.acquire().unwrap();
        assert!(store.acquire().is_none());
        store.release(model);
    }

    #[test]
    fn test_edit_times_out_while_model_is_held() {
        testutil::register_main();
        let store = ModelStore::with_timeout(model(), Duration::from_millis(20));
        let held = store.acquire().unwrap();
        assert!(matches!(
            store.edit(|_| ()),
            Err(ModelError::Unavailable(_))
        ));
        assert!(store.is_enabled());
        store.release(held);
        assert!(store.edit(|_| ()).is_ok());
    }

    #[test]
    fn test_structural_edits_are_never_observed_half_done() {
        testutil::register_main();
        let store = Arc::new(ModelStore::new(model()));
        let done = Arc::new(AtomicBool::new(false));
        let callbacks = Arc::new(AtomicUsize::new(0));

        let render = {
            let store = store.clone();
            let done = done.clone();
            let callbacks = callbacks.clone();
            std_thread::spawn(move || {
                thread::register(Role::Render, true);
                while !done.load(Ordering::Acquire) {
                    if let Some(model) = store.acquire() {
                        // Every rebuild gives all user channels the same name.
                        {
                            let mut names = model.user_channels().map(|c| c.name.as_str());
                            if let Some(first) = names.next() {
                                assert!(names.all(|name| name == first));
                            }
                        }
                        assert_eq!(model.user_channels().count() % 8, 0);
                        callbacks.fetch_add(1, Ordering::Relaxed);
                        store.release(model);
                    }
                    std_thread::yield_now();
                }
            })
        };

        for generation in 0..50 {
            store
                .edit(|model| {
                    let ids: Vec<_> = model.user_channels().map(|c| c.id).collect();
                    for id in ids {
                        model.remove_channel(id);
                    }
                    for _ in 0..8 {
                        let id = model.next_channel_id();
                        let name = format!("generation-{}", generation);
                        model.add_channel(Channel::sample(id, &name, PlayMode::LoopBasic, 64));
                    }
                })
                .unwrap();
        }

        let rebuilt = {
            let mut model = model();
            for _ in 0..16 {
                let id = model.next_channel_id();
                model.add_channel(Channel::sample(id, "loaded", PlayMode::SingleBasic, 64));
            }
            model
        };
        let old = store.replace(rebuilt, |_| {}).unwrap();
        assert_eq!(old.user_channels().count(), 8);

        testutil::eventually(
            || callbacks.load(Ordering::Relaxed) > 0,
            "render thread never ran",
        );
        done.store(true, Ordering::Release);
        render.join().unwrap();
        assert_eq!(store.version(), 51);
    }

    #[test]
    fn test_scalar_writes_are_never_torn() {
        let shared = Arc::new(ChannelShared::default());
        let written = [0.25f32, 0.5, 0.75];
        let done = Arc::new(AtomicBool::new(false));

        let writers: Vec<_> = written
            .iter()
            .map(|value| {
                let shared = shared.clone();
                let value = *value;
                std_thread::spawn(move || {
                    for i in 0..10_000 {
                        shared.set_volume(value);
                        shared.set_pan(1.0 - value);
                        shared.set_mute(i % 2 == 0);
                    }
                })
            })
            .collect();

        let readers: Vec<_> = (0..2)
            .map(|_| {
                let shared = shared.clone();
                let done = done.clone();
                std_thread::spawn(move || {
                    while !done.load(Ordering::Acquire) {
                        let controls = shared.controls();
                        assert!([1.0, 0.25, 0.5, 0.75].contains(&controls.volume));
                        assert!([0.5, 0.75, 0.25].contains(&controls.pan));
                    }
                })
            })
            .collect();

        for writer in writers {
            writer.join().unwrap();
        }
        done.store(true, Ordering::Release);
        for reader in readers {
            reader.join().unwrap();
        }
    }
}
