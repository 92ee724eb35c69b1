use chrono::Utc;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey,
                   Header, Validation};
use serde::{Deserialize, Serialize};

use crate::error::{bad, AppResult};

/// Doctor dashboard credential; `sub` is the doctor id.
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims { pub sub:String, pub exp:i64 }

pub const TTL_SECS: i64 = 12 * 3600;

pub fn sign(doctor_id:i64, secret:&str) -> AppResult<String> {
    let c = Claims { sub: doctor_id.to_string(), exp: Utc::now().timestamp()+TTL_SECS };
    encode(&Header::default(), &c, &EncodingKey::from_secret(secret.as_bytes()))
        .map_err(bad)
}

/// Doctor id carried by a valid, unexpired token.
pub fn verify(token:&str, secret:&str) -> Option<i64> {
    decode::<Claims>(token, &DecodingKey::from_secret(secret.as_bytes()),
                     &Validation::new(Algorithm::HS256))
        .ok()
        .and_then(|d| d.claims.sub.parse().ok())
}
