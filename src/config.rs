use std::{env, str::FromStr};

use crate::{
    error::{AppErr, AppResult},
    pin::{self, PinAllocator},
};

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub bind_addr: String,
    /// Per-room broadcast buffer; slower clients lag and resync.
    pub room_capacity: usize,
    pub pin_alphabet: String,
    pub pin_length: usize,
    pub pin_attempts: u32,
    /// When set, doctor connections need a signed token.
    pub jwt_secret: Option<String>,
    pub body_limit: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: "sqlite://waiting_room.db".into(),
            bind_addr: "0.0.0.0:3000".into(),
            room_capacity: 100,
            pin_alphabet: pin::DEFAULT_ALPHABET.into(),
            pin_length: pin::DEFAULT_LENGTH,
            pin_attempts: pin::DEFAULT_ATTEMPTS,
            jwt_secret: None,
            body_limit: 64 * 1024,
        }
    }
}

impl Config {
    /// Reads the process environment (call `dotenvy::dotenv()` first).
    pub fn from_env() -> AppResult<Self> {
        Self::from_lookup(|k| env::var(k).ok())
    }

    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> AppResult<Self> {
        let d = Self::default();
        Ok(Self {
            database_url: get("DATABASE_URL").unwrap_or(d.database_url),
            bind_addr: get("BIND_ADDR").unwrap_or(d.bind_addr),
            room_capacity: parse(&get, "ROOM_CAPACITY", d.room_capacity)?,
            pin_alphabet: get("PIN_ALPHABET").unwrap_or(d.pin_alphabet),
            pin_length: parse(&get, "PIN_LENGTH", d.pin_length)?,
            pin_attempts: parse(&get, "PIN_ATTEMPTS", d.pin_attempts)?,
            jwt_secret: get("JWT_SECRET").filter(|s| !s.is_empty()),
            body_limit: parse(&get, "BODY_LIMIT", d.body_limit)?,
        })
    }

    pub fn pins(&self) -> PinAllocator {
        PinAllocator::new(&self.pin_alphabet, self.pin_length, self.pin_attempts)
    }
}

fn parse<T: FromStr>(get: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> AppResult<T> {
    match get(key) {
        None => Ok(default),
        Some(v) => v.trim().parse().map_err(|_| AppErr::Bad(format!("{key}: cannot parse {v:?}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let m: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |k| m.get(k).cloned()
    }

    #[test]
    fn defaults_when_unset() {
        let c = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(c.bind_addr, "0.0.0.0:3000");
        assert_eq!(c.room_capacity, 100);
        assert_eq!(c.pin_length, 6);
        assert!(c.jwt_secret.is_none());
    }

    #[test]
    fn reads_overrides() {
        let c = Config::from_lookup(lookup(&[
            ("PIN_LENGTH", "4"),
            ("PIN_ALPHABET", "ABC"),
            ("JWT_SECRET", "s3cret"),
            ("ROOM_CAPACITY", " 8 "),
        ]))
        .unwrap();
        assert_eq!(c.pin_length, 4);
        assert_eq!(c.room_capacity, 8);
        assert_eq!(c.jwt_secret.as_deref(), Some("s3cret"));
        assert_eq!(c.pins().candidate().len(), 4);
    }

    #[test]
    fn bad_number_names_the_variable() {
        let err = Config::from_lookup(lookup(&[("PIN_ATTEMPTS", "lots")])).unwrap_err();
        assert!(err.to_string().contains("PIN_ATTEMPTS"));
    }

    #[test]
    fn empty_secret_means_none() {
        let c = Config::from_lookup(lookup(&[("JWT_SECRET", "")])).unwrap();
        assert!(c.jwt_secret.is_none());
    }
}
