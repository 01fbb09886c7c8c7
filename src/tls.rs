// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use crate::fail::Fail;

use rustls::{
    pki_types::ServerName, ClientConfig, ClientConnection, Connection as RecordLayer,
    RootCertStore, ServerConfig, ServerConnection,
};

use std::{
    convert::TryFrom,
    fs::File,
    io::{self, BufReader, Read, Write},
    sync::Arc,
};

//==============================================================================
// Constants & Structures
//==============================================================================

/// # TLS
///
/// Optional wrapper layer for connections. Plaintext and the socket never
/// touch directly: bytes pass through the in-memory record layer, which
/// buffers handshake and application records until the socket is ready. The
/// handshake is driven by the regular read/write readiness of the owning
/// connection, and its completion is what promotes the connection to open.
///
/// Certificate issuance and verification policy are out of scope: contexts
/// consume the chain, key and trust anchors they are given.

/// Read size for draining decrypted plaintext.
const PLAIN_CHUNK: usize = 4096;

/// Outcome of pumping inbound records.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TlsRead {
    /// The session remains open.
    Open,
    /// The peer closed the stream (socket EOF or close-notify).
    Eof,
}

/// TLS Session
pub struct TlsSession {
    record: RecordLayer,
}

/// TLS Context factory.
pub struct TlsContext;

//==============================================================================
// Associate Functions
//==============================================================================

/// Associate functions for [TlsContext].
impl TlsContext {
    /// Builds a server side configuration from PEM encoded certificate
    /// chain and private key files.
    pub fn server(
        cer_file: &str,
        key_file: &str,
        alpn: &[&str],
    ) -> Result<Arc<ServerConfig>, Fail> {
        let certs = Self::load_certs(cer_file)?;
        let key = Self::load_key(key_file)?;
        let mut config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|error| Fail::HandshakeFailed {
                details: error.to_string(),
            })?;
        config.alpn_protocols = alpn.iter().map(|p| p.as_bytes().to_vec()).collect();
        Ok(Arc::new(config))
    }

    /// Builds a client side configuration trusting the given PEM encoded
    /// anchors.
    pub fn client(ca_file: &str, alpn: &[&str]) -> Result<Arc<ClientConfig>, Fail> {
        let mut roots = RootCertStore::empty();
        for cert in Self::load_certs(ca_file)? {
            roots.add(cert).map_err(|error| Fail::HandshakeFailed {
                details: error.to_string(),
            })?;
        }
        let mut config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        config.alpn_protocols = alpn.iter().map(|p| p.as_bytes().to_vec()).collect();
        Ok(Arc::new(config))
    }

    /// Loads a PEM encoded certificate chain.
    fn load_certs(
        path: &str,
    ) -> Result<Vec<rustls::pki_types::CertificateDer<'static>>, Fail> {
        let file = File::open(path)?;
        let mut reader = BufReader::new(file);
        let mut certs = Vec::new();
        for cert in rustls_pemfile::certs(&mut reader) {
            certs.push(cert?);
        }
        if certs.is_empty() {
            return Err(Fail::Invalid {
                details: "no certificates in chain file",
            });
        }
        Ok(certs)
    }

    /// Loads a PEM encoded private key.
    fn load_key(path: &str) -> Result<rustls::pki_types::PrivateKeyDer<'static>, Fail> {
        let file = File::open(path)?;
        let mut reader = BufReader::new(file);
        rustls_pemfile::private_key(&mut reader)?.ok_or(Fail::Invalid {
            details: "no private key in key file",
        })
    }
}

/// Associate functions for [TlsSession].
impl TlsSession {
    /// Creates the server side of a session.
    pub fn server(config: Arc<ServerConfig>) -> Result<Self, Fail> {
        let session = ServerConnection::new(config).map_err(|error| Fail::HandshakeFailed {
            details: error.to_string(),
        })?;
        Ok(Self {
            record: RecordLayer::Server(session),
        })
    }

    /// Creates the client side of a session for the given server name.
    pub fn client(config: Arc<ClientConfig>, server_name: &str) -> Result<Self, Fail> {
        let name: ServerName<'static> = ServerName::try_from(server_name.to_string())
            .map_err(|_| Fail::Invalid {
                details: "invalid server name",
            })?;
        let session =
            ClientConnection::new(config, name).map_err(|error| Fail::HandshakeFailed {
                details: error.to_string(),
            })?;
        Ok(Self {
            record: RecordLayer::Client(session),
        })
    }

    /// Returns whether the handshake is still in flight.
    pub fn is_handshaking(&self) -> bool {
        self.record.is_handshaking()
    }

    /// Returns whether records are buffered for the socket.
    pub fn wants_write(&self) -> bool {
        self.record.wants_write()
    }

    /// Returns the ALPN protocol agreed on, if any.
    pub fn alpn_protocol(&self) -> Option<Vec<u8>> {
        self.record.alpn_protocol().map(|p| p.to_vec())
    }

    /// Pumps inbound records from the socket and appends the decrypted
    /// plaintext to `plain`. Handshake failures surface as errors and must
    /// close the connection before it ever opens.
    pub fn read_records(
        &mut self,
        sock: &mut dyn Read,
        plain: &mut Vec<u8>,
    ) -> Result<TlsRead, Fail> {
        let mut eof = false;
        loop {
            match self.record.read_tls(sock) {
                Ok(0) => {
                    eof = true;
                    break;
                }
                Ok(_) => {
                    let handshaking = self.record.is_handshaking();
                    if let Err(error) = self.record.process_new_packets() {
                        if handshaking {
                            return Err(Fail::HandshakeFailed {
                                details: error.to_string(),
                            });
                        }
                        return Err(Fail::Malformed {
                            details: "invalid TLS record",
                        });
                    }
                }
                Err(ref error) if error.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref error) if error.kind() == io::ErrorKind::Interrupted => continue,
                Err(error) => return Err(error.into()),
            }
        }
        if self.drain_plaintext(plain)? {
            eof = true;
        }
        if eof {
            Ok(TlsRead::Eof)
        } else {
            Ok(TlsRead::Open)
        }
    }

    /// Buffers plaintext into the record layer, returning how many bytes
    /// were accepted.
    pub fn write_plain(&mut self, data: &[u8]) -> Result<usize, Fail> {
        match self.record.writer().write(data) {
            Ok(count) => Ok(count),
            Err(ref error) if error.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(error) => Err(error.into()),
        }
    }

    /// Flushes buffered records to the socket until the socket pushes back.
    pub fn write_records(&mut self, sock: &mut dyn Write) -> Result<(), Fail> {
        while self.record.wants_write() {
            match self.record.write_tls(sock) {
                Ok(_) => (),
                Err(ref error) if error.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref error) if error.kind() == io::ErrorKind::Interrupted => continue,
                Err(error) => return Err(error.into()),
            }
        }
        Ok(())
    }

    /// Drains decrypted plaintext out of the record layer. Returns whether
    /// the peer sent a close-notify.
    fn drain_plaintext(&mut self, plain: &mut Vec<u8>) -> Result<bool, Fail> {
        let mut chunk = [0u8; PLAIN_CHUNK];
        loop {
            match self.record.reader().read(&mut chunk) {
                Ok(0) => return Ok(true),
                Ok(count) => plain.extend_from_slice(&chunk[..count]),
                Err(ref error) if error.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(ref error) if error.kind() == io::ErrorKind::UnexpectedEof => return Ok(true),
                Err(error) => return Err(error.into()),
            }
        }
    }
}
