//! Audio devices that tracks open streams on.
//!
//! [`CpalDevice`] talks to real hardware. [`ManualDevice`] runs callbacks
//! only when asked, which makes tracks testable without a sound card and
//! lets an application drive the audio clock itself.

#![allow(clippy::unwrap_used)] // Tests use unwrap for brevity

use std::sync::Arc;
use std::thread;

use audiotrack_core::{Error, Result, StreamSettings};
use cpal::{
    traits::{DeviceTrait, HostTrait, StreamTrait},
    BufferSize, Device, SampleFormat, SampleRate, Stream, StreamConfig,
};
use crossbeam_channel::bounded;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

/// Fills an interleaved block of output samples.
pub type OutputCallback = Box<dyn FnMut(&mut [f32]) + Send + 'static>;

/// Receives an interleaved block of captured samples.
pub type InputCallback = Box<dyn FnMut(&[f32]) + Send + 'static>;

/// Receives errors raised by the device while a stream runs.
pub type ErrorCallback = Arc<dyn Fn(Error) + Send + Sync + 'static>;

/// Something that can run audio callbacks.
pub trait AudioDevice: Send + Sync {
    fn name(&self) -> String;

    fn open_output(
        &self,
        settings: &StreamSettings,
        callback: OutputCallback,
        on_error: ErrorCallback,
    ) -> Result<StreamHandle>;

    fn open_input(
        &self,
        settings: &StreamSettings,
        callback: InputCallback,
        on_error: ErrorCallback,
    ) -> Result<StreamHandle>;
}

/// Keeps a stream running. Closing or dropping it stops the stream and
/// drops its callback before returning.
pub struct StreamHandle {
    closer: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl StreamHandle {
    pub fn new(closer: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            closer: Some(Box::new(closer)),
        }
    }

    pub fn close(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(closer) = self.closer.take() {
            closer();
        }
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamHandle")
            .field("open", &self.closer.is_some())
            .finish()
    }
}

/// A cpal device, the host default unless a name is given.
#[derive(Debug, Clone, Default)]
pub struct CpalDevice {
    device_name: Option<String>,
}

impl CpalDevice {
    pub const fn default_device() -> Self {
        Self { device_name: None }
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self {
            device_name: Some(name.into()),
        }
    }

    fn output_device(&self) -> Result<Device> {
        let host = cpal::default_host();
        match &self.device_name {
            None => host
                .default_output_device()
                .ok_or_else(|| Error::Device("No output device found".to_string())),
            Some(name) => host
                .output_devices()
                .map_err(|e| Error::Device(format!("Failed to list devices: {e}")))?
                .find(|d| d.name().is_ok_and(|n| &n == name))
                .ok_or_else(|| Error::Device(format!("Output device '{name}' not found"))),
        }
    }

    fn input_device(&self) -> Result<Device> {
        let host = cpal::default_host();
        match &self.device_name {
            None => host
                .default_input_device()
                .ok_or_else(|| Error::Device("No input device found".to_string())),
            Some(name) => host
                .input_devices()
                .map_err(|e| Error::Device(format!("Failed to list devices: {e}")))?
                .find(|d| d.name().is_ok_and(|n| &n == name))
                .ok_or_else(|| Error::Device(format!("Input device '{name}' not found"))),
        }
    }
}

fn stream_config(settings: &StreamSettings) -> StreamConfig {
    StreamConfig {
        channels: settings.channels,
        sample_rate: SampleRate(settings.sample_rate),
        buffer_size: BufferSize::Fixed(settings.block_size),
    }
}

impl AudioDevice for CpalDevice {
    fn name(&self) -> String {
        self.device_name
            .clone()
            .or_else(default_device_name)
            .unwrap_or_else(|| "Unknown".to_string())
    }

    fn open_output(
        &self,
        settings: &StreamSettings,
        callback: OutputCallback,
        on_error: ErrorCallback,
    ) -> Result<StreamHandle> {
        let this = self.clone();
        let settings = *settings;
        // cpal::Stream is not Send, so the stream lives on its own thread
        spawn_stream("audiotrack-output", move || {
            let device = this.output_device()?;
            let device_name = device.name().unwrap_or_else(|_| "Unknown".to_string());
            let sample_format = device
                .default_output_config()
                .map_err(|e| Error::Device(format!("Failed to get output config: {e}")))?
                .sample_format();
            let config = stream_config(&settings);

            info!(
                "Opening output on {device_name}: {} Hz, {} channels, {} frames per block",
                settings.sample_rate, settings.channels, settings.block_size
            );

            let block = settings.block_samples();
            match sample_format {
                SampleFormat::F32 => {
                    build_output::<f32>(&device, &config, block, callback, on_error)
                }
                SampleFormat::I16 => {
                    build_output::<i16>(&device, &config, block, callback, on_error)
                }
                SampleFormat::U16 => {
                    build_output::<u16>(&device, &config, block, callback, on_error)
                }
                _ => Err(Error::Device(format!(
                    "Unsupported sample format: {sample_format:?}"
                ))),
            }
        })
    }

    fn open_input(
        &self,
        settings: &StreamSettings,
        callback: InputCallback,
        on_error: ErrorCallback,
    ) -> Result<StreamHandle> {
        let this = self.clone();
        let settings = *settings;
        spawn_stream("audiotrack-input", move || {
            let device = this.input_device()?;
            let device_name = device.name().unwrap_or_else(|_| "Unknown".to_string());
            let sample_format = device
                .default_input_config()
                .map_err(|e| Error::Device(format!("Failed to get input config: {e}")))?
                .sample_format();
            let config = stream_config(&settings);

            info!(
                "Opening input on {device_name}: {} Hz, {} channels, {} frames per block",
                settings.sample_rate, settings.channels, settings.block_size
            );

            let block = settings.block_samples();
            match sample_format {
                SampleFormat::F32 => build_input::<f32>(&device, &config, block, callback, on_error),
                SampleFormat::I16 => build_input::<i16>(&device, &config, block, callback, on_error),
                SampleFormat::U16 => build_input::<u16>(&device, &config, block, callback, on_error),
                _ => Err(Error::Device(format!(
                    "Unsupported sample format: {sample_format:?}"
                ))),
            }
        })
    }
}

/// Build and start a stream on a dedicated thread that owns it until the
/// returned handle is closed.
fn spawn_stream<F>(thread_name: &str, build: F) -> Result<StreamHandle>
where
    F: FnOnce() -> Result<Stream> + Send + 'static,
{
    let (ready_tx, ready_rx) = bounded::<Result<()>>(1);
    let (shutdown_tx, shutdown_rx) = bounded::<()>(0);

    let handle = thread::Builder::new()
        .name(thread_name.to_string())
        .spawn(move || {
            let stream = match build().and_then(|stream| {
                stream
                    .play()
                    .map_err(|e| Error::Device(format!("Failed to start stream: {e}")))?;
                Ok(stream)
            }) {
                Ok(stream) => stream,
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };
            let _ = ready_tx.send(Ok(()));

            // Returns once the handle drops its sender
            let _ = shutdown_rx.recv();
            drop(stream);
            debug!("Stream closed");
        })
        .map_err(|e| Error::Device(format!("Failed to spawn stream thread: {e}")))?;

    match ready_rx.recv() {
        Ok(Ok(())) => Ok(StreamHandle::new(move || {
            drop(shutdown_tx);
            let _ = handle.join();
        })),
        Ok(Err(e)) => {
            let _ = handle.join();
            Err(e)
        }
        Err(_) => Err(Error::Device(
            "Stream thread exited before starting".to_string(),
        )),
    }
}

fn build_output<T: cpal::SizedSample + cpal::FromSample<f32>>(
    device: &Device,
    config: &StreamConfig,
    block_samples: usize,
    mut callback: OutputCallback,
    on_error: ErrorCallback,
) -> Result<Stream> {
    let err_fn = move |err| {
        error!("Output stream error: {err}");
        on_error(Error::Device(format!("Output stream error: {err}")));
    };

    // Sized for the requested block; only hosts that ignore the fixed buffer
    // size make this grow
    let mut scratch = vec![0.0f32; block_samples];

    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                if scratch.len() < data.len() {
                    scratch.resize(data.len(), 0.0);
                }
                let block = &mut scratch[..data.len()];
                callback(block);
                for (out, sample) in data.iter_mut().zip(block.iter()) {
                    *out = T::from_sample(*sample);
                }
            },
            err_fn,
            None,
        )
        .map_err(|e| Error::Device(format!("Failed to build output stream: {e}")))
}

fn build_input<T>(
    device: &Device,
    config: &StreamConfig,
    block_samples: usize,
    mut callback: InputCallback,
    on_error: ErrorCallback,
) -> Result<Stream>
where
    T: cpal::SizedSample,
    f32: cpal::FromSample<T>,
{
    use cpal::Sample;

    let err_fn = move |err| {
        error!("Input stream error: {err}");
        on_error(Error::Device(format!("Input stream error: {err}")));
    };

    let mut scratch = vec![0.0f32; block_samples];

    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                if scratch.len() < data.len() {
                    scratch.resize(data.len(), 0.0);
                }
                for (out, sample) in scratch.iter_mut().zip(data.iter()) {
                    *out = f32::from_sample(*sample);
                }
                callback(&scratch[..data.len()]);
            },
            err_fn,
            None,
        )
        .map_err(|e| Error::Device(format!("Failed to build input stream: {e}")))
}

/// List available output devices.
pub fn list_output_devices() -> Result<Vec<String>> {
    let host = cpal::default_host();

    let devices: Vec<String> = host
        .output_devices()
        .map_err(|e| Error::Device(format!("Failed to list devices: {e}")))?
        .filter_map(|d| d.name().ok())
        .collect();

    Ok(devices)
}

/// List available input devices.
pub fn list_input_devices() -> Result<Vec<String>> {
    let host = cpal::default_host();

    let devices: Vec<String> = host
        .input_devices()
        .map_err(|e| Error::Device(format!("Failed to list devices: {e}")))?
        .filter_map(|d| d.name().ok())
        .collect();

    Ok(devices)
}

/// Get the default output device name.
pub fn default_device_name() -> Option<String> {
    let host = cpal::default_host();
    host.default_output_device().and_then(|d| d.name().ok())
}

struct ManualOutput {
    settings: StreamSettings,
    callback: Arc<Mutex<Option<OutputCallback>>>,
}

struct ManualInput {
    callback: Arc<Mutex<Option<InputCallback>>>,
}

/// Device whose callbacks run only when pumped.
///
/// [`pump_output`](Self::pump_output) renders every open output stream and
/// mixes them, the way a sound card would sum several tracks.
/// [`push_input`](Self::push_input) delivers samples to every open input.
#[derive(Default)]
pub struct ManualDevice {
    outputs: Mutex<Vec<ManualOutput>>,
    inputs: Mutex<Vec<ManualInput>>,
}

impl ManualDevice {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run one callback of `frames` frames on each open output and return
    /// the mix. Outputs whose channel count differs from the first one are
    /// rendered but left out of the mix.
    pub fn pump_output(&self, frames: usize) -> Vec<f32> {
        let mut outputs = self.outputs.lock();
        outputs.retain(|o| o.callback.lock().is_some());

        let Some(channels) = outputs.first().map(|o| usize::from(o.settings.channels)) else {
            return Vec::new();
        };

        let mut mix = vec![0.0f32; frames * channels];
        let mut block = Vec::new();
        for output in outputs.iter() {
            let stream_channels = usize::from(output.settings.channels);
            block.clear();
            block.resize(frames * stream_channels, 0.0);

            // Held while rendering so closing the stream waits for it
            let mut guard = output.callback.lock();
            let Some(callback) = guard.as_mut() else {
                continue;
            };
            callback(block.as_mut_slice());

            if stream_channels == channels {
                for (m, s) in mix.iter_mut().zip(block.iter()) {
                    *m += *s;
                }
            } else {
                warn!("Skipping {stream_channels}-channel stream in {channels}-channel mix");
            }
        }
        mix
    }

    /// Deliver captured samples to every open input stream.
    pub fn push_input(&self, samples: &[f32]) {
        let inputs = self.inputs.lock();
        for input in inputs.iter() {
            if let Some(callback) = input.callback.lock().as_mut() {
                callback(samples);
            }
        }
    }

    /// Number of streams currently open.
    pub fn open_streams(&self) -> usize {
        let outputs = self.outputs.lock();
        let inputs = self.inputs.lock();
        outputs.iter().filter(|o| o.callback.lock().is_some()).count()
            + inputs.iter().filter(|i| i.callback.lock().is_some()).count()
    }
}

impl AudioDevice for ManualDevice {
    fn name(&self) -> String {
        "manual".to_string()
    }

    fn open_output(
        &self,
        settings: &StreamSettings,
        callback: OutputCallback,
        _on_error: ErrorCallback,
    ) -> Result<StreamHandle> {
        let slot = Arc::new(Mutex::new(Some(callback)));
        self.outputs.lock().push(ManualOutput {
            settings: *settings,
            callback: slot.clone(),
        });
        Ok(StreamHandle::new(move || {
            let callback = slot.lock().take();
            drop(callback);
        }))
    }

    fn open_input(
        &self,
        _settings: &StreamSettings,
        callback: InputCallback,
        _on_error: ErrorCallback,
    ) -> Result<StreamHandle> {
        let slot = Arc::new(Mutex::new(Some(callback)));
        self.inputs.lock().push(ManualInput {
            callback: slot.clone(),
        });
        Ok(StreamHandle::new(move || {
            let callback = slot.lock().take();
            drop(callback);
        }))
    }
}
