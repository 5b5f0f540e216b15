use hmac::{Hmac, Mac};
use sha1::Sha1;
use sha2::Sha256;

use crate::error::{Error, Result};

/// HMAC identifiers usable in an AUTH chunk, from the registry in
/// https://tools.ietf.org/html/rfc4895#section-8.2
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum HmacAlgorithm {
    Sha1,
    Sha256,
}

impl HmacAlgorithm {
    pub(crate) fn from_id(id: u16) -> Result<Self> {
        match id {
            1 => Ok(HmacAlgorithm::Sha1),
            3 => Ok(HmacAlgorithm::Sha256),
            _ => Err(Error::ErrInvalidAlgorithmType),
        }
    }

    pub(crate) fn id(self) -> u16 {
        match self {
            HmacAlgorithm::Sha1 => 1,
            HmacAlgorithm::Sha256 => 3,
        }
    }

    /// Length of the MAC this algorithm produces.
    pub fn digest_len(self) -> usize {
        match self {
            HmacAlgorithm::Sha1 => 20,
            HmacAlgorithm::Sha256 => 32,
        }
    }
}

/// The MAC over an AUTH chunk's coverage: the AUTH chunk with its HMAC field
/// set to zero, followed by every chunk after it in the same packet
/// (RFC 4895 section 6.3).
pub(crate) fn calculate_hmac(
    algorithm: HmacAlgorithm,
    key: &[u8],
    data: &[u8],
) -> Result<Vec<u8>> {
    match algorithm {
        HmacAlgorithm::Sha1 => {
            let mut mac =
                Hmac::<Sha1>::new_from_slice(key).map_err(|_| Error::ErrAuthKeyInvalid)?;
            mac.update(data);
            Ok(mac.finalize().into_bytes().to_vec())
        }
        HmacAlgorithm::Sha256 => {
            let mut mac =
                Hmac::<Sha256>::new_from_slice(key).map_err(|_| Error::ErrAuthKeyInvalid)?;
            mac.update(data);
            Ok(mac.finalize().into_bytes().to_vec())
        }
    }
}
