//! Parameters handed over by the control channel once a parallel transfer
//! has been negotiated.

use crate::config::CipherConfig;
use crate::errors::{TransferFault, TransferResult};

/// Hard cap on parallel connections per transfer.
pub const MAX_THREAD_NUMBER: usize = 16;

#[derive(Clone)]
pub struct NegotiatedSession {
    pub host: String,
    pub port: u16,
    pub number_of_threads: usize,
    /// Cookie each worker writes right after connecting.
    pub one_time_password: i32,
    pub ssl_negotiated: bool,
    /// Secret shared over the encrypted control channel, seeds key derivation.
    pub shared_secret: Vec<u8>,
    pub cipher: CipherConfig,
}

impl NegotiatedSession {
    pub fn plain(host: impl Into<String>, port: u16, number_of_threads: usize, password: i32) -> Self {
        Self {
            host: host.into(),
            port,
            number_of_threads,
            one_time_password: password,
            ssl_negotiated: false,
            shared_secret: Vec::new(),
            cipher: CipherConfig::default(),
        }
    }

    pub fn with_encryption(mut self, shared_secret: Vec<u8>, cipher: CipherConfig) -> Self {
        self.ssl_negotiated = true;
        self.shared_secret = shared_secret;
        self.cipher = cipher;
        self
    }

    pub fn validate(&self) -> TransferResult<()> {
        if self.host.is_empty() {
            return Err(TransferFault::Configuration("host is empty".into()));
        }
        if self.port < 1 {
            return Err(TransferFault::Configuration("port must be supplied".into()));
        }
        if self.number_of_threads == 0 {
            return Err(TransferFault::Configuration(
                "this is not a parallel transfer, the number of threads supplied is zero".into(),
            ));
        }
        if self.number_of_threads > MAX_THREAD_NUMBER {
            return Err(TransferFault::Configuration(format!(
                "{} threads requested, maximum is {}",
                self.number_of_threads, MAX_THREAD_NUMBER
            )));
        }
        if self.one_time_password <= 0 {
            return Err(TransferFault::Configuration("password is invalid".into()));
        }
        if self.ssl_negotiated && self.shared_secret.is_empty() {
            return Err(TransferFault::Configuration(
                "encrypted session negotiated without a shared secret".into(),
            ));
        }
        Ok(())
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl std::fmt::Debug for NegotiatedSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NegotiatedSession")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("number_of_threads", &self.number_of_threads)
            .field("ssl_negotiated", &self.ssl_negotiated)
            .field("cipher", &self.cipher)
            .finish_non_exhaustive()
    }
}
