//! 认证握手用到的随机数和keyed hash
//!
//! 响应的计算方式和HMAC-SHA1一样，只是key是`secret || salt`：
//!
//! ```text
//! K = secret || salt       (超过64字节先hash，再补0到64字节)
//! response = H((K ^ 0x5c) || H((K ^ 0x36) || challenge))
//! ```
//!
//! salt由响应方生成并随响应一起发送，避免对方选择明文。

use std::time::{SystemTime, UNIX_EPOCH};

use rand::RngCore;
use sha1::{Digest as _, Sha1};

pub const DIGEST_LEN: usize = 20;
const BLOCK_SIZE: usize = 64;

pub type Digest = [u8; DIGEST_LEN];

/// 全0的challenge / response / salt
pub const ZERO: Digest = [0; DIGEST_LEN];

fn sha1(parts: &[&[u8]]) -> Digest {
    let mut hasher = Sha1::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// 20字节随机值：当前时间和64字节随机数的SHA-1
pub fn random_value() -> Digest {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default();
    let mut noise = [0u8; 64];
    rand::thread_rng().fill_bytes(&mut noise);
    sha1(&[now.to_string().as_bytes(), &noise])
}

/// 以`key`对`message`做HMAC-SHA1
pub fn keyed_hash(key: &[u8], message: &[u8]) -> Digest {
    let mut block = [0u8; BLOCK_SIZE];
    if key.len() > BLOCK_SIZE {
        block[..DIGEST_LEN].copy_from_slice(&sha1(&[key]));
    } else {
        block[..key.len()].copy_from_slice(key);
    }
    let ipad: Vec<u8> = block.iter().map(|b| b ^ 0x36).collect();
    let opad: Vec<u8> = block.iter().map(|b| b ^ 0x5c).collect();
    let inner = sha1(&[&ipad, message]);
    sha1(&[&opad, &inner])
}

/// 用共享密钥和`salt`计算对`challenge`的响应
pub fn challenge_response(secret: &[u8], challenge: &[u8], salt: &Digest) -> Digest {
    let key = [secret, salt.as_slice()].concat();
    keyed_hash(&key, challenge)
}

/// 生成新的salt并计算响应，返回`(response, salt)`
pub fn respond(secret: &[u8], challenge: &Digest) -> (Digest, Digest) {
    let salt = random_value();
    (challenge_response(secret, challenge, &salt), salt)
}

/// 校验对方的响应；比较时间与内容无关
pub fn verify(secret: &[u8], challenge: &Digest, salt: &Digest, response: &Digest) -> bool {
    let expected = challenge_response(secret, challenge, salt);
    expected
        .iter()
        .zip(response.iter())
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hex(s: &str) -> Vec<u8> {
        (0..s.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&s[i..i + 2], 16).unwrap())
            .collect()
    }

    // RFC 2202 test cases 1, 2 and 6
    #[test]
    fn matches_hmac_sha1_vectors() {
        assert_eq!(
            keyed_hash(&[0x0b; 20], b"Hi There").to_vec(),
            hex("b617318655057264e28bc0b6fb378c8ef146be00")
        );
        assert_eq!(
            keyed_hash(b"Jefe", b"what do ya want for nothing?").to_vec(),
            hex("effcdf6ae5eb2fa2d27416d5f184df9c259a7c79")
        );
        assert_eq!(
            keyed_hash(
                &[0xaa; 80],
                b"Test Using Larger Than Block-Size Key - Hash Key First"
            )
            .to_vec(),
            hex("aa4ae5e15272d00e95705637ce8a3b55ed402112")
        );
    }

    #[test]
    fn secret_and_salt_form_the_key() {
        // empty secret and a 20 byte salt reduce to RFC 2202 case 1
        assert_eq!(
            challenge_response(b"", b"Hi There", &[0x0b; 20]).to_vec(),
            hex("b617318655057264e28bc0b6fb378c8ef146be00")
        );
        let challenge = [7u8; DIGEST_LEN];
        let salt = [9u8; DIGEST_LEN];
        let mut key = b"abc".to_vec();
        key.extend_from_slice(&salt);
        assert_eq!(
            challenge_response(b"abc", &challenge, &salt),
            keyed_hash(&key, &challenge)
        );
    }

    #[test]
    fn response_is_deterministic_for_fixed_inputs() {
        let challenge = [0x42; DIGEST_LEN];
        let salt = [0x17; DIGEST_LEN];
        let a = challenge_response(b"abc", &challenge, &salt);
        let b = challenge_response(b"abc", &challenge, &salt);
        assert_eq!(a, b);
        assert_ne!(a, challenge_response(b"abd", &challenge, &salt));
        assert!(verify(b"abc", &challenge, &salt, &a));
        assert!(!verify(b"abc", &challenge, &[0x18; DIGEST_LEN], &a));
    }

    #[test]
    fn random_values_differ() {
        let (a, b) = (random_value(), random_value());
        assert_ne!(a, b);
        assert_ne!(a, ZERO);
        let (response, salt) = respond(b"s", &a);
        assert!(verify(b"s", &a, &salt, &response));
    }
}
