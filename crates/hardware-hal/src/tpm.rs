//! TPM 2.0 backend
//!
//! Talks to a TPM through the TSS2 ESAPI. Key handles handed out are ESYS
//! resource handles; sessions are HMAC sessions with AES-128-CFB parameter
//! encryption.

use crate::traits::*;
use crate::{HardwareError, HardwareResult};
use std::collections::HashMap;
use std::str::FromStr;
use tss_esapi::attributes::{NvIndexAttributesBuilder, ObjectAttributesBuilder, SessionAttributesBuilder};
use tss_esapi::constants::tss::{TPM2_RH_NULL, TPM2_ST_HASHCHECK};
use tss_esapi::constants::{CapabilityType, NvIndexType, SessionType};
use tss_esapi::handles::{
    KeyHandle as EsysKeyHandle, NvIndexHandle, NvIndexTpmHandle, ObjectHandle,
    SessionHandle as EsysSessionHandle, TpmHandle,
};
use tss_esapi::interface_types::algorithm::{HashingAlgorithm, PublicAlgorithm};
use tss_esapi::interface_types::ecc::EccCurve;
use tss_esapi::interface_types::resource_handles::{Hierarchy, NvAuth, Provision};
use tss_esapi::interface_types::session_handles::AuthSession;
use tss_esapi::structures::{
    CapabilityData, Digest, EccParameter, EccPoint as TpmEccPoint, EccScheme, HashScheme,
    HashcheckTicket, KeyDerivationFunctionScheme, MaxBuffer, MaxNvBuffer, NvPublicBuilder, Public,
    PublicBuilder, PublicEccParametersBuilder, Signature, SignatureScheme, SymmetricDefinition,
    SymmetricDefinitionObject,
};
use tss_esapi::tcti_ldr::TctiNameConf;
use tss_esapi::tss2_esys::{ESYS_TR, TPM2_HANDLE, TPMT_TK_HASHCHECK};
use tss_esapi::Context;

/// Transient slots assumed for a discrete TPM
pub const TPM_TRANSIENT_SLOTS: usize = 3;

fn esys(what: &'static str) -> impl Fn(tss_esapi::Error) -> HardwareError {
    move |e| HardwareError::CommunicationError(format!("{}: {}", what, e))
}

fn coordinate(parameter: &EccParameter) -> HardwareResult<[u8; COORDINATE_LEN]> {
    let value = parameter.value();
    if value.len() > COORDINATE_LEN {
        return Err(HardwareError::CryptoError(format!(
            "{}-byte coordinate exceeds P-256 field size",
            value.len()
        )));
    }

    // The TPM drops leading zero bytes; restore fixed width.
    let mut out = [0u8; COORDINATE_LEN];
    out[COORDINATE_LEN - value.len()..].copy_from_slice(value);
    Ok(out)
}

fn to_tpm_point(point: &EccPoint) -> HardwareResult<TpmEccPoint> {
    Ok(TpmEccPoint::new(
        EccParameter::try_from(point.x.to_vec()).map_err(esys("ecc parameter"))?,
        EccParameter::try_from(point.y.to_vec()).map_err(esys("ecc parameter"))?,
    ))
}

fn from_tpm_point(point: &TpmEccPoint) -> HardwareResult<EccPoint> {
    Ok(EccPoint::new(coordinate(point.x())?, coordinate(point.y())?))
}

/// TPM 2.0 device
pub struct TpmHsm {
    context: Context,
    sessions: HashMap<u32, AuthSession>,
}

impl TpmHsm {
    /// Connect through the given TCTI, or the `TPM2TOOLS_TCTI`/`TCTI`
    /// environment when `None`
    pub fn open(tcti: Option<&str>) -> HardwareResult<Self> {
        let conf = match tcti {
            Some(tcti) => TctiNameConf::from_str(tcti).map_err(esys("tcti"))?,
            None => TctiNameConf::from_environment_variable().map_err(esys("tcti"))?,
        };

        let context = Context::new(conf).map_err(esys("esys initialization"))?;
        log::info!("TPM context opened");

        Ok(TpmHsm {
            context,
            sessions: HashMap::new(),
        })
    }

    fn primary_public(template: &KeyTemplate) -> HardwareResult<Public> {
        let object_attributes = ObjectAttributesBuilder::new()
            .with_user_with_auth(true)
            .with_admin_with_policy(true)
            .with_sign_encrypt(true)
            .with_decrypt(true)
            .with_fixed_tpm(true)
            .with_fixed_parent(true)
            .with_sensitive_data_origin(true)
            .build()
            .map_err(esys("object attributes"))?;

        let ecc_parameters = PublicEccParametersBuilder::new()
            .with_symmetric(SymmetricDefinitionObject::Null)
            .with_ecc_scheme(EccScheme::Null)
            .with_curve(EccCurve::NistP256)
            .with_key_derivation_function_scheme(KeyDerivationFunctionScheme::Null)
            .with_is_signing_key(true)
            .with_is_decryption_key(true)
            .with_restricted(false)
            .build()
            .map_err(esys("ecc parameters"))?;

        PublicBuilder::new()
            .with_public_algorithm(PublicAlgorithm::Ecc)
            .with_name_hashing_algorithm(HashingAlgorithm::Sha256)
            .with_object_attributes(object_attributes)
            .with_auth_policy(Digest::try_from(PRIMARY_AUTH_POLICY.to_vec()).map_err(esys("auth policy"))?)
            .with_ecc_parameters(ecc_parameters)
            .with_ecc_unique_identifier(to_tpm_point(&template.unique)?)
            .build()
            .map_err(esys("public template"))
    }

    fn session(&self, session: SessionHandle) -> HardwareResult<AuthSession> {
        self.sessions.get(&session.0).copied().ok_or_else(|| {
            HardwareError::SessionError(format!("session {:#010x} is not open", session.0))
        })
    }

    fn nv_handle(&mut self, index: NvIndex) -> HardwareResult<NvIndexHandle> {
        let tpm_handle = NvIndexTpmHandle::new(index.0).map_err(esys("nv index"))?;
        let object = self
            .context
            .tr_from_tpm_public(TpmHandle::NvIndex(tpm_handle))
            .map_err(esys("tr_from_tpm_public"))?;
        Ok(NvIndexHandle::from(object))
    }

    fn close_nv_handle(&mut self, handle: NvIndexHandle) {
        let mut object = ObjectHandle::from(handle);
        if let Err(e) = self.context.tr_close(&mut object) {
            log::warn!("failed to close NV resource: {}", e);
        }
    }
}

impl HsmCapability for TpmHsm {
    fn info(&self) -> BackendInfo {
        BackendInfo {
            name: "tpm2".to_string(),
            transient_slots: TPM_TRANSIENT_SLOTS,
        }
    }

    fn create_primary(&mut self, template: &KeyTemplate) -> HardwareResult<PrimaryKey> {
        let public = Self::primary_public(template)?;

        let result = self
            .context
            .execute_with_nullauth_session(|ctx| {
                ctx.create_primary(Hierarchy::Endorsement, public, None, None, None, None)
            })
            .map_err(|e| HardwareError::KeyCreationError(e.to_string()))?;

        let point = match &result.out_public {
            Public::Ecc { unique, .. } => from_tpm_point(unique)?,
            _ => {
                return Err(HardwareError::KeyCreationError(
                    "TPM returned a non-ECC public area".to_string(),
                ))
            }
        };

        Ok(PrimaryKey {
            handle: KeyHandle(ESYS_TR::from(result.key_handle)),
            public: point,
        })
    }

    fn sign_digest(&mut self, handle: KeyHandle, digest: &[u8; 32]) -> HardwareResult<RawSignature> {
        let key = EsysKeyHandle::from(handle.0);
        let digest = Digest::try_from(digest.to_vec()).map_err(esys("digest"))?;
        let validation = HashcheckTicket::try_from(TPMT_TK_HASHCHECK {
            tag: TPM2_ST_HASHCHECK,
            hierarchy: TPM2_RH_NULL,
            digest: Default::default(),
        })
        .map_err(esys("hashcheck ticket"))?;
        let scheme = SignatureScheme::EcDsa {
            hash_scheme: HashScheme::new(HashingAlgorithm::Sha256),
        };

        let signature = self
            .context
            .execute_with_nullauth_session(|ctx| ctx.sign(key, digest, scheme, validation))
            .map_err(|e| HardwareError::CryptoError(format!("sign: {}", e)))?;

        match signature {
            Signature::EcDsa(ecc) => Ok(RawSignature {
                r: coordinate(ecc.signature_r())?,
                s: coordinate(ecc.signature_s())?,
            }),
            _ => Err(HardwareError::CryptoError(
                "TPM returned a non-ECDSA signature".to_string(),
            )),
        }
    }

    fn ecdh_z_gen(&mut self, handle: KeyHandle, peer: &EccPoint) -> HardwareResult<EccPoint> {
        let key = EsysKeyHandle::from(handle.0);
        let in_point = to_tpm_point(peer)?;

        let z_point = self
            .context
            .execute_with_nullauth_session(|ctx| ctx.ecdh_z_gen(key, in_point))
            .map_err(|e| HardwareError::CryptoError(format!("ecdh_z_gen: {}", e)))?;

        from_tpm_point(&z_point)
    }

    fn flush(&mut self, handle: KeyHandle) -> HardwareResult<()> {
        self.context
            .flush_context(ObjectHandle::from(EsysKeyHandle::from(handle.0)))
            .map_err(|_| HardwareError::InvalidHandle(handle.0))
    }

    fn hash_sha256(&mut self, data: &[u8]) -> HardwareResult<[u8; 32]> {
        let buffer = MaxBuffer::try_from(data.to_vec()).map_err(esys("hash buffer"))?;
        let (digest, _ticket) = self
            .context
            .hash(buffer, HashingAlgorithm::Sha256, Hierarchy::Owner)
            .map_err(esys("hash"))?;

        let mut out = [0u8; 32];
        if digest.value().len() != out.len() {
            return Err(HardwareError::CryptoError(format!(
                "unexpected {}-byte SHA-256 digest",
                digest.value().len()
            )));
        }
        out.copy_from_slice(digest.value());
        Ok(out)
    }

    fn start_session(&mut self) -> HardwareResult<SessionHandle> {
        let session = self
            .context
            .start_auth_session(
                None,
                None,
                None,
                SessionType::Hmac,
                SymmetricDefinition::AES_128_CFB,
                HashingAlgorithm::Sha256,
            )
            .map_err(|e| HardwareError::SessionError(e.to_string()))?
            .ok_or_else(|| HardwareError::SessionError("no session returned".to_string()))?;

        let (attributes, mask) = SessionAttributesBuilder::new()
            .with_decrypt(true)
            .with_encrypt(true)
            .with_continue_session(true)
            .build();
        self.context
            .tr_sess_set_attributes(session, attributes, mask)
            .map_err(|e| HardwareError::SessionError(e.to_string()))?;

        let raw = ESYS_TR::from(EsysSessionHandle::from(session));
        self.sessions.insert(raw, session);
        Ok(SessionHandle(raw))
    }

    fn end_session(&mut self, session: SessionHandle) -> HardwareResult<()> {
        let auth = self.session(session)?;
        self.sessions.remove(&session.0);
        self.context
            .flush_context(ObjectHandle::from(EsysSessionHandle::from(auth)))
            .map_err(|e| HardwareError::SessionError(e.to_string()))
    }

    fn nv_defined(&mut self, index: NvIndex) -> HardwareResult<bool> {
        let (capability, _more) = self
            .context
            .get_capability(CapabilityType::Handles, index.0, 1)
            .map_err(esys("get_capability"))?;

        Ok(match capability {
            CapabilityData::Handles(handles) => handles
                .into_inner()
                .into_iter()
                .any(|handle| TPM2_HANDLE::from(handle) == index.0),
            _ => false,
        })
    }

    fn nv_define(&mut self, session: SessionHandle, index: NvIndex, size: usize) -> HardwareResult<()> {
        let auth = self.session(session)?;
        let attributes = NvIndexAttributesBuilder::new()
            .with_nv_index_type(NvIndexType::Ordinary)
            .with_write_all(true)
            .with_auth_write(true)
            .with_policy_read(true)
            .with_auth_read(true)
            .with_owner_read(true)
            .build()
            .map_err(esys("nv attributes"))?;
        let public = NvPublicBuilder::new()
            .with_nv_index(NvIndexTpmHandle::new(index.0).map_err(esys("nv index"))?)
            .with_index_name_algorithm(HashingAlgorithm::Sha256)
            .with_index_attributes(attributes)
            .with_data_area_size(size)
            .build()
            .map_err(esys("nv public"))?;

        let handle = self
            .context
            .execute_with_session(Some(auth), |ctx| ctx.nv_define_space(Provision::Owner, None, public))
            .map_err(|e| HardwareError::StorageError(format!("nv_define_space: {}", e)))?;
        self.close_nv_handle(handle);
        Ok(())
    }

    fn get_random(&mut self, session: SessionHandle, len: usize) -> HardwareResult<Vec<u8>> {
        let auth = self.session(session)?;
        let random = self
            .context
            .execute_with_session(Some(auth), |ctx| ctx.get_random(len))
            .map_err(esys("get_random"))?;
        Ok(random.value().to_vec())
    }

    fn nv_write(&mut self, session: SessionHandle, index: NvIndex, data: &[u8]) -> HardwareResult<()> {
        let auth = self.session(session)?;
        let buffer = MaxNvBuffer::try_from(data.to_vec()).map_err(esys("nv buffer"))?;
        let handle = self.nv_handle(index)?;

        let result = self
            .context
            .execute_with_session(Some(auth), |ctx| ctx.nv_write(NvAuth::NvIndex(handle), handle, buffer, 0))
            .map_err(|e| HardwareError::StorageError(format!("nv_write: {}", e)));
        self.close_nv_handle(handle);
        result
    }

    fn nv_read(&mut self, session: SessionHandle, index: NvIndex, len: usize) -> HardwareResult<Vec<u8>> {
        let auth = self.session(session)?;
        let size = u16::try_from(len)
            .map_err(|_| HardwareError::InvalidParameter(format!("NV read of {} bytes", len)))?;
        let handle = self.nv_handle(index)?;

        let result = self
            .context
            .execute_with_session(Some(auth), |ctx| ctx.nv_read(NvAuth::NvIndex(handle), handle, size, 0))
            .map(|buffer| buffer.value().to_vec())
            .map_err(|e| HardwareError::StorageError(format!("nv_read: {}", e)));
        self.close_nv_handle(handle);
        result
    }
}
