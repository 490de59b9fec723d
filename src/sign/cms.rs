//! PKCS#7 `SignedData` as used by JAR signature blocks, declared with rasn.
//!
//! Only the detached, attribute-less form is produced and accepted.

use super::Signer;
use anyhow::{Context, Result};
use rasn::types::{Any, ConstOid, Integer, ObjectIdentifier, OctetString, SetOf};
use rasn::{AsnType, Decode, Encode};
use rasn_pkix::{AlgorithmIdentifier, Name};

pub const RSA_ENCRYPTION: ConstOid = ConstOid(&[1, 2, 840, 113549, 1, 1, 1]);
pub const SHA256_WITH_RSA: ConstOid = ConstOid(&[1, 2, 840, 113549, 1, 1, 11]);
pub const SHA256: ConstOid = ConstOid(&[2, 16, 840, 1, 101, 3, 4, 2, 1]);
pub const PKCS7_DATA: ConstOid = ConstOid(&[1, 2, 840, 113549, 1, 7, 1]);
pub const PKCS7_SIGNED_DATA: ConstOid = ConstOid(&[1, 2, 840, 113549, 1, 7, 2]);

pub(crate) fn der_encode<T: Encode>(value: &T) -> Result<Vec<u8>> {
    rasn::der::encode(value).map_err(|err| anyhow::anyhow!("DER encoding failed: {}", err))
}

pub(crate) fn der_decode<T: Decode>(bytes: &[u8]) -> Result<T> {
    rasn::der::decode(bytes).map_err(|err| anyhow::anyhow!("DER decoding failed: {}", err))
}

/// `AlgorithmIdentifier` with NULL parameters.
pub fn algorithm(oid: ConstOid) -> Result<AlgorithmIdentifier> {
    Ok(AlgorithmIdentifier {
        algorithm: oid.into(),
        parameters: Some(Any::new(der_encode(&())?)),
    })
}

#[derive(AsnType, Clone, Debug, Decode, Encode, PartialEq, Eq, PartialOrd, Ord)]
pub struct ContentInfo {
    pub content_type: ObjectIdentifier,
    #[rasn(tag(explicit(0)))]
    pub content: Option<Any>,
}

#[derive(AsnType, Clone, Debug, Decode, Encode, PartialEq, Eq, PartialOrd, Ord)]
pub struct SignedData {
    pub version: Integer,
    pub digest_algorithms: SetOf<AlgorithmIdentifier>,
    pub content_info: ContentInfo,
    /// Kept as raw DER so the certificates come back byte for byte.
    #[rasn(tag(0))]
    pub certificates: Option<SetOf<Any>>,
    #[rasn(tag(1))]
    pub crls: Option<SetOf<Any>>,
    pub signer_infos: SetOf<SignerInfo>,
}

#[derive(AsnType, Clone, Debug, Decode, Encode, PartialEq, Eq, PartialOrd, Ord)]
pub struct IssuerAndSerialNumber {
    pub issuer: Name,
    pub serial_number: Integer,
}

#[derive(AsnType, Clone, Debug, Decode, Encode, PartialEq, Eq, PartialOrd, Ord)]
pub struct SignerInfo {
    pub version: Integer,
    pub issuer_and_serial_number: IssuerAndSerialNumber,
    pub digest_algorithm: AlgorithmIdentifier,
    #[rasn(tag(0))]
    pub authenticated_attributes: Option<SetOf<Any>>,
    pub digest_encryption_algorithm: AlgorithmIdentifier,
    pub encrypted_digest: OctetString,
    #[rasn(tag(1))]
    pub unauthenticated_attributes: Option<SetOf<Any>>,
}

/// Detached `SignedData` over `content`, signed with SHA-256 and RSA.
pub fn sign_detached(signer: &Signer, content: &[u8]) -> Result<Vec<u8>> {
    let tbs = &signer.cert().tbs_certificate;
    let signer_info = SignerInfo {
        version: Integer::from(1),
        issuer_and_serial_number: IssuerAndSerialNumber {
            issuer: tbs.issuer.clone(),
            serial_number: tbs.serial_number.clone(),
        },
        digest_algorithm: algorithm(SHA256)?,
        authenticated_attributes: None,
        digest_encryption_algorithm: algorithm(RSA_ENCRYPTION)?,
        encrypted_digest: OctetString::from(signer.sign(content)?),
        unauthenticated_attributes: None,
    };
    let signed_data = SignedData {
        version: Integer::from(1),
        digest_algorithms: SetOf::from([algorithm(SHA256)?]),
        content_info: ContentInfo {
            content_type: PKCS7_DATA.into(),
            content: None,
        },
        certificates: Some(SetOf::from([Any::new(signer.cert_der().to_vec())])),
        crls: None,
        signer_infos: SetOf::from([signer_info]),
    };
    der_encode(&ContentInfo {
        content_type: PKCS7_SIGNED_DATA.into(),
        content: Some(Any::new(der_encode(&signed_data)?)),
    })
}

/// The parts of a signature block verification needs.
#[derive(Clone, Debug)]
pub struct DetachedSignature {
    pub certificates: Vec<Vec<u8>>,
    pub digest_algorithm: ObjectIdentifier,
    pub signature: Vec<u8>,
}

impl DetachedSignature {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let content_info: ContentInfo = der_decode(bytes).context("not a ContentInfo")?;
        anyhow::ensure!(
            PKCS7_SIGNED_DATA == content_info.content_type,
            "not a PKCS#7 SignedData block"
        );
        let content = content_info.content.context("SignedData has no content")?;
        let signed_data: SignedData = der_decode(content.as_bytes())?;
        anyhow::ensure!(
            signed_data.content_info.content.is_none(),
            "signed content is embedded, expected a detached signature"
        );
        anyhow::ensure!(
            signed_data.signer_infos.len() == 1,
            "expected one SignerInfo, found {}",
            signed_data.signer_infos.len()
        );
        let info = signed_data
            .signer_infos
            .into_iter()
            .next()
            .context("missing SignerInfo")?;
        anyhow::ensure!(
            info.authenticated_attributes.is_none(),
            "signed attributes are not supported"
        );
        Ok(Self {
            certificates: signed_data
                .certificates
                .unwrap_or_default()
                .into_iter()
                .map(Any::into_bytes)
                .collect(),
            digest_algorithm: info.digest_algorithm.algorithm,
            signature: info.encrypted_digest.to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sign::{identity, IdentityConfig};

    #[test]
    fn should_encode_algorithm_with_null_parameters() {
        assert_eq!(
            der_encode(&algorithm(SHA256).unwrap()).unwrap(),
            vec![
                0x30, 0x0d, 0x06, 0x09, 0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02, 0x01, 0x05,
                0x00
            ]
        );
    }

    #[test]
    fn should_read_back_a_detached_signature() {
        let signer = identity::generate(&IdentityConfig::throwaway("unused.p12")).unwrap();
        let block = sign_detached(&signer, b"Signature-Version: 1.0\r\n\r\n").unwrap();
        let parsed = DetachedSignature::parse(&block).unwrap();
        assert_eq!(parsed.certificates, vec![signer.cert_der().to_vec()]);
        assert!(SHA256 == parsed.digest_algorithm);
        assert_eq!(
            parsed.signature,
            signer.sign(b"Signature-Version: 1.0\r\n\r\n").unwrap()
        );

        let info: ContentInfo = der_decode(&block).unwrap();
        let signed_data: SignedData = der_decode(info.content.unwrap().as_bytes()).unwrap();
        let signer_info = signed_data.signer_infos.iter().next().unwrap();
        assert_eq!(
            signer_info.issuer_and_serial_number.issuer,
            signer.cert().tbs_certificate.issuer
        );
    }

    #[test]
    fn should_reject_other_content_types() {
        let data = der_encode(&ContentInfo {
            content_type: PKCS7_DATA.into(),
            content: None,
        })
        .unwrap();
        assert!(DetachedSignature::parse(&data).is_err());
        assert!(DetachedSignature::parse(b"\x30\x05\x01").is_err());
    }
}
