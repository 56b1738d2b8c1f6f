//! Filter stages sitting between ingress and the encoders

pub mod audio;

pub use audio::AudioFanoutFilter;
