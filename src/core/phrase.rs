//! Spoken phrase to movement command
//! Turns a recognized (Polish) utterance such as "jedź do przodu 50 cm" into
//! a [`Command`]. Direction words are matched anywhere in the phrase, the
//! distance is the number spoken right before "cm".

use std::sync::LazyLock;

use log::debug;
use regex::Regex;
use thiserror::Error;

use crate::core::bluetooth::Command;
use crate::core::bluetooth::constants::DEFAULT_SPEED;

const FORWARD_WORDS: &[&str] = &["przodu", "prosto"];
const RIGHT_WORDS: &[&str] = &["prawo", "prawej"];
const BACKWARD_WORDS: &[&str] = &["tyłu", "tył"];
const LEFT_WORDS: &[&str] = &["lewo", "lewej"];

static DISTANCE_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+)\s*cm").expect("distance pattern is valid"));

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PhraseError {
    #[error("no distance in centimetres found in {0:?}")]
    MissingDistance(String),
    #[error("distance {0} cm is out of range")]
    DistanceOutOfRange(String),
}

/// Builds movement commands from recognized speech
#[derive(Debug, Clone, Copy)]
pub struct PhraseParser {
    speed: u8,
}

impl Default for PhraseParser {
    fn default() -> Self {
        Self::new(DEFAULT_SPEED)
    }
}

impl PhraseParser {
    pub fn new(speed: u8) -> Self {
        Self { speed }
    }

    pub fn parse(&self, utterance: &str) -> Result<Command, PhraseError> {
        let voice = utterance.to_lowercase();
        let mentions = |words: &[&str]| words.iter().any(|word| voice.contains(word));

        let captures = DISTANCE_PATTERN
            .captures(&voice)
            .ok_or_else(|| PhraseError::MissingDistance(utterance.to_string()))?;
        let digits = &captures[1];
        let distance_cm = digits
            .parse()
            .map_err(|_| PhraseError::DistanceOutOfRange(digits.to_string()))?;

        let command = Command {
            forward: mentions(FORWARD_WORDS),
            backward: mentions(BACKWARD_WORDS),
            left: mentions(LEFT_WORDS),
            right: mentions(RIGHT_WORDS),
            distance_cm,
            speed: self.speed,
        };
        debug!("Parsed {:?} into {:?}", utterance, command);
        Ok(command)
    }
}
