//! TLCP support through the Tongsuo NTLS API
//!
//! Stock OpenSSL has no TLCP. When the crate is built with the `ntls` feature
//! and linked against Tongsuo, contexts are switched to NTLS mode and get the
//! dual signing/encryption certificates installed. Without the feature the
//! certificates are still checked so configuration errors surface early, but no
//! TLCP handshake can run.

use openssl::ssl::SslContextBuilder;

use crate::common::Result;
use crate::config::CipherSuite;
use crate::security::CertifiedKey;

/// Whether this build can run TLCP handshakes
pub const AVAILABLE: bool = cfg!(feature = "ntls");

/// Message used when a TLCP handshake is requested from a build without NTLS
pub const UNAVAILABLE_REASON: &str = "TLCP not supported by the linked OpenSSL (build with the `ntls` feature against Tongsuo)";

#[cfg(feature = "ntls")]
mod ffi {
    use openssl_sys::{EVP_PKEY, SSL_CTX, X509};
    use std::os::raw::c_int;

    extern "C" {
        pub fn SSL_CTX_enable_ntls(ctx: *mut SSL_CTX);
        pub fn SSL_CTX_use_sign_certificate(ctx: *mut SSL_CTX, x: *mut X509) -> c_int;
        pub fn SSL_CTX_use_sign_PrivateKey(ctx: *mut SSL_CTX, pkey: *mut EVP_PKEY) -> c_int;
        pub fn SSL_CTX_use_enc_certificate(ctx: *mut SSL_CTX, x: *mut X509) -> c_int;
        pub fn SSL_CTX_use_enc_PrivateKey(ctx: *mut SSL_CTX, pkey: *mut EVP_PKEY) -> c_int;
    }
}

#[cfg(feature = "ntls")]
fn cvt(ret: std::os::raw::c_int) -> Result<()> {
    if ret <= 0 {
        Err(openssl::error::ErrorStack::get().into())
    } else {
        Ok(())
    }
}

/// Switch a context to TLCP and install its certificates
#[cfg(feature = "ntls")]
pub fn configure(
    builder: &mut SslContextBuilder,
    sign: Option<&CertifiedKey>,
    enc: Option<&CertifiedKey>,
) -> Result<()> {
    use foreign_types_shared::ForeignType;

    let ctx = builder.as_ptr();
    // SAFETY: ctx is owned by the builder for the duration of these calls; the
    // certificate and key pointers come from live owned objects and Tongsuo
    // takes its own references.
    unsafe {
        ffi::SSL_CTX_enable_ntls(ctx);
        if let Some(sign) = sign {
            cvt(ffi::SSL_CTX_use_sign_certificate(ctx, sign.certificate().as_ptr()))?;
            cvt(ffi::SSL_CTX_use_sign_PrivateKey(ctx, sign.private_key().as_ptr()))?;
        }
        if let Some(enc) = enc {
            cvt(ffi::SSL_CTX_use_enc_certificate(ctx, enc.certificate().as_ptr()))?;
            cvt(ffi::SSL_CTX_use_enc_PrivateKey(ctx, enc.private_key().as_ptr()))?;
        }
    }

    if let Some(sign) = sign {
        for cert in sign.intermediates() {
            builder.add_extra_chain_cert(cert.clone())?;
        }
    }
    Ok(())
}

/// Check the certificates against a plain context; nothing is enabled
#[cfg(not(feature = "ntls"))]
pub fn configure(
    builder: &mut SslContextBuilder,
    sign: Option<&CertifiedKey>,
    _enc: Option<&CertifiedKey>,
) -> Result<()> {
    if let Some(sign) = sign {
        builder.set_certificate(sign.certificate())?;
        builder.set_private_key(sign.private_key())?;
        builder.check_private_key()?;
    }
    Ok(())
}

/// Restrict the TLCP cipher list
///
/// Tongsuo names are unknown to stock OpenSSL, so the list is only applied
/// when NTLS is available.
pub fn set_cipher_list(builder: &mut SslContextBuilder, suites: &[CipherSuite]) -> Result<()> {
    if AVAILABLE && !suites.is_empty() {
        let list = suites.iter().map(|s| s.openssl_name).collect::<Vec<_>>().join(":");
        builder.set_cipher_list(&list)?;
    }
    Ok(())
}
