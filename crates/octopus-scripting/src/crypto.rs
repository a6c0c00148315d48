//! Public key import and signature verification
//!
//! Keys arrive as DER SubjectPublicKeyInfo. `ring`'s [`UnparsedPublicKey`] takes only the
//! inner key (an RSAPublicKey, or an uncompressed EC point) and cannot read the SPKI
//! wrapper, so the wrapper is unwrapped here with a minimal TLV reader. The algorithm OID
//! decides which `ring` verification algorithm applies.

use ring::signature::{self, UnparsedPublicKey, VerificationAlgorithm};

const OID_RSA_ENCRYPTION: &[u8] = &[0x2a, 0x86, 0x48, 0x86, 0xf7, 0x0d, 0x01, 0x01, 0x01];
const OID_EC_PUBLIC_KEY: &[u8] = &[0x2a, 0x86, 0x48, 0xce, 0x3d, 0x02, 0x01];
const OID_PRIME256V1: &[u8] = &[0x2a, 0x86, 0x48, 0xce, 0x3d, 0x03, 0x01, 0x07];
const OID_SECP384R1: &[u8] = &[0x2b, 0x81, 0x04, 0x00, 0x22];

const TAG_INTEGER: u8 = 0x02;
const TAG_BIT_STRING: u8 = 0x03;
const TAG_OID: u8 = 0x06;
const TAG_SEQUENCE: u8 = 0x30;

/// Key algorithm recognized from the DER encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAlgorithm {
    /// RSA (PKCS#1 v1.5 signatures)
    Rsa,
    /// ECDSA over P-256
    EcdsaP256,
    /// ECDSA over P-384
    EcdsaP384,
}

/// A parsed public key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicKey {
    algorithm: KeyAlgorithm,
    /// RSAPublicKey DER for RSA, uncompressed point for EC
    key: Vec<u8>,
}

impl PublicKey {
    /// Key algorithm
    pub fn algorithm(&self) -> KeyAlgorithm {
        self.algorithm
    }
}

/// Split one DER TLV off `input`: (tag, contents, rest)
fn read_tlv(input: &[u8]) -> Option<(u8, &[u8], &[u8])> {
    let (&tag, input) = input.split_first()?;
    let (&first, input) = input.split_first()?;
    let (length, input) = if first & 0x80 == 0 {
        (usize::from(first), input)
    } else {
        let count = usize::from(first & 0x7f);
        if count == 0 || count > 4 || input.len() < count {
            return None;
        }
        let length = input[..count]
            .iter()
            .fold(0usize, |acc, b| (acc << 8) | usize::from(*b));
        (length, &input[count..])
    };
    if input.len() < length {
        return None;
    }
    Some((tag, &input[..length], &input[length..]))
}

fn expect(tag: u8, input: &[u8]) -> Option<(&[u8], &[u8])> {
    match read_tlv(input)? {
        (t, contents, rest) if t == tag => Some((contents, rest)),
        _ => None,
    }
}

fn parse_spki(der: &[u8]) -> Option<PublicKey> {
    let (spki, _) = expect(TAG_SEQUENCE, der)?;
    let (algorithm, rest) = expect(TAG_SEQUENCE, spki)?;
    let (bits, _) = expect(TAG_BIT_STRING, rest)?;
    let (&unused, key) = bits.split_first()?;
    if unused != 0 {
        return None;
    }

    let (oid, params) = expect(TAG_OID, algorithm)?;
    let algorithm = if oid == OID_RSA_ENCRYPTION {
        KeyAlgorithm::Rsa
    } else if oid == OID_EC_PUBLIC_KEY {
        let (curve, _) = expect(TAG_OID, params)?;
        if curve == OID_PRIME256V1 {
            KeyAlgorithm::EcdsaP256
        } else if curve == OID_SECP384R1 {
            KeyAlgorithm::EcdsaP384
        } else {
            return None;
        }
    } else {
        return None;
    };

    Some(PublicKey {
        algorithm,
        key: key.to_vec(),
    })
}

fn parse_pkcs1(der: &[u8]) -> Option<PublicKey> {
    let (contents, rest) = expect(TAG_SEQUENCE, der)?;
    let (_, contents) = expect(TAG_INTEGER, contents)?;
    let (_, contents) = expect(TAG_INTEGER, contents)?;
    if !rest.is_empty() || !contents.is_empty() {
        return None;
    }
    Some(PublicKey {
        algorithm: KeyAlgorithm::Rsa,
        key: der.to_vec(),
    })
}

/// Parse a DER SubjectPublicKeyInfo, or a bare PKCS#1 RSA public key
pub fn import_public_key(der: &[u8]) -> Option<PublicKey> {
    parse_spki(der).or_else(|| parse_pkcs1(der))
}

/// Digest named by a script
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    /// SHA-1
    Sha1,
    /// SHA-256
    Sha256,
    /// SHA-384
    Sha384,
    /// SHA-512
    Sha512,
}

impl HashAlgorithm {
    /// Parse a digest name, ignoring case
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "sha1" => Some(Self::Sha1),
            "sha256" => Some(Self::Sha256),
            "sha384" => Some(Self::Sha384),
            "sha512" => Some(Self::Sha512),
            _ => None,
        }
    }
}

fn verification_algorithm(
    hash: HashAlgorithm,
    algorithm: KeyAlgorithm,
) -> Option<&'static dyn VerificationAlgorithm> {
    use HashAlgorithm::*;
    use KeyAlgorithm::*;

    let algorithm: &'static dyn VerificationAlgorithm = match (algorithm, hash) {
        (Rsa, Sha1) => &signature::RSA_PKCS1_2048_8192_SHA1_FOR_LEGACY_USE_ONLY,
        (Rsa, Sha256) => &signature::RSA_PKCS1_2048_8192_SHA256,
        (Rsa, Sha384) => &signature::RSA_PKCS1_2048_8192_SHA384,
        (Rsa, Sha512) => &signature::RSA_PKCS1_2048_8192_SHA512,
        (EcdsaP256, Sha256) => &signature::ECDSA_P256_SHA256_ASN1,
        (EcdsaP256, Sha384) => &signature::ECDSA_P256_SHA384_ASN1,
        (EcdsaP384, Sha256) => &signature::ECDSA_P384_SHA256_ASN1,
        (EcdsaP384, Sha384) => &signature::ECDSA_P384_SHA384_ASN1,
        _ => return None,
    };
    Some(algorithm)
}

/// Verify `signature` over `text` with a previously imported key
///
/// The error is the message handed back to the script. A missing key, or a key that cannot
/// be used with the digest, fails the same way as an unusable key would at digest setup.
pub fn verify_signature(
    hash: &str,
    key: Option<&PublicKey>,
    signature: &[u8],
    text: &[u8],
) -> Result<(), String> {
    let digest = HashAlgorithm::from_name(hash).ok_or_else(|| format!("{} is not supported.", hash))?;
    let (key, algorithm) = key
        .and_then(|key| Some((key, verification_algorithm(digest, key.algorithm)?)))
        .ok_or_else(|| "Failed to initialize digest verify.".to_string())?;
    UnparsedPublicKey::new(algorithm, &key.key)
        .verify(text, signature)
        .map_err(|_| "Failed to verify digest.".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ring::rand::SystemRandom;
    use ring::signature::{EcdsaKeyPair, KeyPair};

    const RSA_SPKI_HEX: &str = "30820122300d06092a864886f70d01010105000382010f003082010a0282010100b353a49f6f91dec0933fc554a15da6bb5446f33f1a7346634a93236daff5d25fe0033df7dd586d0c3e47cebcb68a57228d39c9fa6bf92e883686fc883f8d73d10ee1d9de5961a11836dbb68d4682ad2569c8b760afa0b6bcce8cedba5eccf2b52cec3785bf646bbf15c3286b06a789b8c45fb57a2e685c5a6a49eb8721d945730c81a89d65a64ff075a656ac88b85b740c882ecb707788ae849d4f9ac8a142d3b4be58d66ed239a43b22f45b705d49e5955d064576a846453228e0fd35dadab401294d6be613530206e194498dc4b6b52eee42524928168b643adc85cf4db0e9b873a2c0a6cd91c5fd326b6b94a7b690f3bfe48e4d3e66a779672c90fc0632650203010001";
    const RSA_SHA256_SIG_HEX: &str = "980407b0765e3397051c600b8132c2481b701ebcace3953cd12ab8df7a89c713b9c512a404d80af809bbfeb7eb73145cda52b0723718aacdda76b9c7e2bba18a61321ae693866f19ea878acb017ace0ed6db27821a8ac2b97fbaca6bde99743d279ddb5d2796134bbe084386242d34cf5fff2191e7949992f20cdcf6404794215b1ddba683d8a5f69ea963c740385fd800b4d12eff9236b5555e95c09809a209c7ee4e843dde99ef22fa88893b4db9ebaf3b066ae6089acfe6989d1a61ead85ead0093100fe16e2a6cc386177af65b8d4fce4bf88483d5453bbcd8fb7133ac0de12b3817e8606aaf90893c375666c7ca02a830ec7a1adf59ea5827f4992f09b4";

    fn hex(s: &str) -> Vec<u8> {
        (0..s.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&s[i..i + 2], 16).unwrap())
            .collect()
    }

    #[test]
    fn test_rsa_signature() {
        let key = import_public_key(&hex(RSA_SPKI_HEX)).unwrap();
        assert_eq!(key.algorithm(), KeyAlgorithm::Rsa);

        let sig = hex(RSA_SHA256_SIG_HEX);
        assert_eq!(verify_signature("sha256", Some(&key), &sig, b"hello"), Ok(()));
        assert_eq!(verify_signature("SHA256", Some(&key), &sig, b"hello"), Ok(()));
        assert_eq!(
            verify_signature("sha256", Some(&key), &sig, b"hellp"),
            Err("Failed to verify digest.".to_string())
        );
        assert_eq!(
            verify_signature("sha224", Some(&key), &sig, b"hello"),
            Err("sha224 is not supported.".to_string())
        );
        assert_eq!(
            verify_signature("sha256", None, &sig, b"hello"),
            Err("Failed to initialize digest verify.".to_string())
        );
    }

    #[test]
    fn test_ecdsa_signature() {
        let rng = SystemRandom::new();
        let alg = &signature::ECDSA_P256_SHA256_ASN1_SIGNING;
        let pkcs8 = EcdsaKeyPair::generate_pkcs8(alg, &rng).unwrap();
        let pair = EcdsaKeyPair::from_pkcs8(alg, pkcs8.as_ref(), &rng).unwrap();

        let mut spki = hex("3059301306072a8648ce3d020106082a8648ce3d030107034200");
        spki.extend_from_slice(pair.public_key().as_ref());

        let key = import_public_key(&spki).unwrap();
        assert_eq!(key.algorithm(), KeyAlgorithm::EcdsaP256);

        let sig = pair.sign(&rng, b"payload").unwrap();
        assert_eq!(verify_signature("SHA256", Some(&key), sig.as_ref(), b"payload"), Ok(()));
        assert_eq!(
            verify_signature("SHA512", Some(&key), sig.as_ref(), b"payload"),
            Err("Failed to initialize digest verify.".to_string())
        );
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert!(import_public_key(b"not a key").is_none());
        assert!(import_public_key(&[]).is_none());
        assert!(import_public_key(&[0x30, 0x82, 0xff]).is_none());
    }
}
