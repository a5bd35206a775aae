//! Threshold secret sharing over GF(2^8)
//!
//! A secret is split byte-wise: each byte is the constant term of a random
//! polynomial of degree `threshold - 1`, and share `x` carries the polynomial
//! evaluated at `x` for every byte. Any `threshold` distinct shares recover the
//! secret by Lagrange interpolation at zero; fewer shares produce noise.

use rand::RngCore;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Share {
    pub x: u8,
    #[serde(with = "crate::crypto::hex_bytes")]
    pub y: Vec<u8>,
}

fn gf_mul(mut a: u8, mut b: u8) -> u8 {
    let mut product = 0u8;
    while b != 0 {
        if b & 1 != 0 {
            product ^= a;
        }
        let carry = a & 0x80;
        a <<= 1;
        if carry != 0 {
            a ^= 0x1b;
        }
        b >>= 1;
    }
    product
}

fn gf_pow(mut base: u8, mut exp: u8) -> u8 {
    let mut result = 1u8;
    while exp != 0 {
        if exp & 1 != 0 {
            result = gf_mul(result, base);
        }
        base = gf_mul(base, base);
        exp >>= 1;
    }
    result
}

fn gf_inv(a: u8) -> u8 {
    // a^254 == a^-1 for every non-zero a
    gf_pow(a, 254)
}

fn gf_div(a: u8, b: u8) -> u8 {
    gf_mul(a, gf_inv(b))
}

/// Split `secret` into `count` shares with x = 1..=count.
///
/// Returns `None` when the parameters cannot produce a recoverable split.
pub fn split<R: RngCore>(
    secret: &[u8],
    threshold: usize,
    count: usize,
    rng: &mut R,
) -> Option<Vec<Share>> {
    if threshold == 0 || threshold > count || count > 255 {
        return None;
    }

    let mut shares: Vec<Share> = (1..=count as u8)
        .map(|x| Share {
            x,
            y: Vec::with_capacity(secret.len()),
        })
        .collect();

    let mut coefficients = vec![0u8; threshold];
    for &byte in secret {
        coefficients[0] = byte;
        rng.fill_bytes(&mut coefficients[1..]);

        for share in shares.iter_mut() {
            // Horner evaluation from the highest coefficient down
            let mut acc = 0u8;
            for &c in coefficients.iter().rev() {
                acc = gf_mul(acc, share.x) ^ c;
            }
            share.y.push(acc);
        }
    }
    Some(shares)
}

/// Recover the secret from `shares`.
///
/// Returns `None` for an empty set, duplicate or zero x coordinates, or shares
/// of different lengths.
pub fn combine(shares: &[Share]) -> Option<Vec<u8>> {
    let first = shares.first()?;
    let len = first.y.len();

    for (i, share) in shares.iter().enumerate() {
        if share.x == 0 || share.y.len() != len {
            return None;
        }
        if shares[..i].iter().any(|s| s.x == share.x) {
            return None;
        }
    }

    let basis: Vec<u8> = shares
        .iter()
        .map(|si| {
            shares
                .iter()
                .filter(|sj| sj.x != si.x)
                .fold(1u8, |acc, sj| gf_mul(acc, gf_div(sj.x, sj.x ^ si.x)))
        })
        .collect();

    let secret = (0..len)
        .map(|byte| {
            shares
                .iter()
                .zip(&basis)
                .fold(0u8, |acc, (share, &l)| acc ^ gf_mul(share.y[byte], l))
        })
        .collect();
    Some(secret)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_field_inverse() {
        for a in 1..=255u8 {
            assert_eq!(gf_mul(a, gf_inv(a)), 1, "inverse failed for {a}");
        }
    }

    #[test]
    fn test_threshold_recovers_secret() {
        let mut rng = StdRng::seed_from_u64(7);
        let secret = 1_700_000_000_123u64.to_be_bytes();
        let shares = split(&secret, 3, 5, &mut rng).unwrap();

        assert_eq!(combine(&shares[..3]).unwrap(), secret.to_vec());
        assert_eq!(combine(&shares[2..]).unwrap(), secret.to_vec());
        assert_eq!(combine(&shares).unwrap(), secret.to_vec());

        let picked = vec![shares[4].clone(), shares[0].clone(), shares[2].clone()];
        assert_eq!(combine(&picked).unwrap(), secret.to_vec());
    }

    #[test]
    fn test_below_threshold_does_not_recover() {
        let mut rng = StdRng::seed_from_u64(11);
        let secret = 42u64.to_be_bytes();
        let shares = split(&secret, 3, 5, &mut rng).unwrap();
        assert_ne!(combine(&shares[..2]).unwrap(), secret.to_vec());
    }

    #[test]
    fn test_rejects_bad_parameters() {
        let mut rng = StdRng::seed_from_u64(1);
        assert!(split(b"s", 0, 3, &mut rng).is_none());
        assert!(split(b"s", 4, 3, &mut rng).is_none());
        assert!(combine(&[]).is_none());

        let share = Share { x: 1, y: vec![9] };
        assert!(combine(&[share.clone(), share]).is_none());
    }

    #[test]
    fn test_single_share_threshold_one() {
        let mut rng = StdRng::seed_from_u64(3);
        let shares = split(b"abc", 1, 1, &mut rng).unwrap();
        assert_eq!(combine(&shares).unwrap(), b"abc".to_vec());
    }
}
