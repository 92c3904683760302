//! Track descriptors.
//!
//! The core never acquires camera/microphone/screen capture itself. An
//! external collaborator hands it already-acquired local tracks, described by
//! these types. Remote tracks are surfaced the same way, as descriptors.

use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackKind::Audio => write!(f, "audio"),
            TrackKind::Video => write!(f, "video"),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TrackError {
    #[error("No local tracks supplied")]
    Empty,
    #[error("More than one {0} track supplied")]
    DuplicateKind(TrackKind),
}

/// One already-acquired local track.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalTrack {
    /// Stable id, used as the wire-level track id.
    pub id: String,
    pub kind: TrackKind,
    /// Human-readable source label ("FaceTime HD Camera", "screen:1", ...).
    pub label: String,
    /// Whether samples are currently flowing (mute / camera-off flips this).
    pub enabled: bool,
}

impl LocalTrack {
    pub fn audio(label: impl Into<String>) -> Self {
        Self::new(TrackKind::Audio, label)
    }

    pub fn video(label: impl Into<String>) -> Self {
        Self::new(TrackKind::Video, label)
    }

    fn new(kind: TrackKind, label: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            label: label.into(),
            enabled: true,
        }
    }
}

/// The local track set attached to every media connection: at most one track
/// per kind, never empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalTracks {
    audio: Option<LocalTrack>,
    video: Option<LocalTrack>,
}

impl LocalTracks {
    pub fn new(tracks: Vec<LocalTrack>) -> Result<Self, TrackError> {
        if tracks.is_empty() {
            return Err(TrackError::Empty);
        }
        let mut audio = None;
        let mut video = None;
        for track in tracks {
            let slot = match track.kind {
                TrackKind::Audio => &mut audio,
                TrackKind::Video => &mut video,
            };
            if slot.is_some() {
                return Err(TrackError::DuplicateKind(track.kind));
            }
            *slot = Some(track);
        }
        Ok(Self { audio, video })
    }

    pub fn get(&self, kind: TrackKind) -> Option<&LocalTrack> {
        match kind {
            TrackKind::Audio => self.audio.as_ref(),
            TrackKind::Video => self.video.as_ref(),
        }
    }

    /// Replace the track of `track.kind`, returning the previous one.
    pub fn set(&mut self, track: LocalTrack) -> Option<LocalTrack> {
        match track.kind {
            TrackKind::Audio => self.audio.replace(track),
            TrackKind::Video => self.video.replace(track),
        }
    }

    pub fn set_enabled(&mut self, kind: TrackKind, enabled: bool) -> bool {
        let slot = match kind {
            TrackKind::Audio => self.audio.as_mut(),
            TrackKind::Video => self.video.as_mut(),
        };
        match slot {
            Some(track) => {
                track.enabled = enabled;
                true
            }
            None => false,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &LocalTrack> {
        self.audio.iter().chain(self.video.iter())
    }
}

/// A remote participant's track, as announced by the media engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrack {
    pub id: String,
    pub kind: TrackKind,
}

/// The remote stream surfaced for a participant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteStream {
    pub id: String,
    pub tracks: Vec<RemoteTrack>,
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_track_set_is_rejected() {
        assert_eq!(LocalTracks::new(vec![]), Err(TrackError::Empty));
    }

    #[test]
    fn test_duplicate_kind_is_rejected() {
        let result = LocalTracks::new(vec![
            LocalTrack::audio("mic"),
            LocalTrack::audio("other mic"),
        ]);
        assert_eq!(result, Err(TrackError::DuplicateKind(TrackKind::Audio)));
    }

    #[test]
    fn test_audio_and_video_slots() {
        let tracks =
            LocalTracks::new(vec![LocalTrack::audio("mic"), LocalTrack::video("cam")]).unwrap();
        assert_eq!(tracks.get(TrackKind::Audio).unwrap().label, "mic");
        assert_eq!(tracks.get(TrackKind::Video).unwrap().label, "cam");
        assert_eq!(tracks.iter().count(), 2);
    }

    #[test]
    fn test_set_replaces_only_matching_kind() {
        let mut tracks =
            LocalTracks::new(vec![LocalTrack::audio("mic"), LocalTrack::video("cam")]).unwrap();
        let previous = tracks.set(LocalTrack::video("screen:1")).unwrap();
        assert_eq!(previous.label, "cam");
        assert_eq!(tracks.get(TrackKind::Video).unwrap().label, "screen:1");
        assert_eq!(tracks.get(TrackKind::Audio).unwrap().label, "mic");
    }

    #[test]
    fn test_set_enabled_flips_flag() {
        let mut tracks = LocalTracks::new(vec![LocalTrack::audio("mic")]).unwrap();
        assert!(tracks.set_enabled(TrackKind::Audio, false));
        assert!(!tracks.get(TrackKind::Audio).unwrap().enabled);
        assert!(!tracks.set_enabled(TrackKind::Video, false));
    }

    #[test]
    fn test_track_ids_are_unique() {
        assert_ne!(LocalTrack::audio("a").id, LocalTrack::audio("a").id);
    }
}
