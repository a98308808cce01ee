#![deny(
    trivial_numeric_casts,
    missing_docs,
    unsafe_code,
    unstable_features,
    unused_import_braces,
    unused_qualifications,
    unused_extern_crates
)]
#![warn(rust_2021_compatibility, unreachable_pub)]

//! Typed, bounded channel endpoints used for every named connection between
//! dataflow components.
//!
//! This crate deliberately does not open sockets: a production deployment
//! swaps the constructors below for a real network manager without any
//! component needing to change, since every component only ever holds a
//! [`Sender`]/[`Receiver`] pair, never a raw transport handle.

use std::time::Duration;

/// Errors that can occur sending or receiving on a typed connection.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// The send could not complete before its deadline.
    #[error("send to '{connection}' timed out after {timeout_ms} ms")]
    SendTimeout {
        /// The connection name.
        connection: String,
        /// The configured timeout, in milliseconds.
        timeout_ms: u64,
    },

    /// The receive could not complete before its deadline.
    #[error("recv from '{connection}' timed out after {timeout_ms} ms")]
    RecvTimeout {
        /// The connection name.
        connection: String,
        /// The configured timeout, in milliseconds.
        timeout_ms: u64,
    },

    /// The channel's peer has been dropped.
    #[error("connection '{connection}' closed")]
    Closed {
        /// The connection name.
        connection: String,
    },
}

/// The sending half of a typed connection.
#[derive(Clone)]
pub struct Sender<T> {
    name: String,
    inner: flume::Sender<T>,
}

/// The receiving half of a typed connection.
pub struct Receiver<T> {
    name: String,
    inner: flume::Receiver<T>,
}

/// Creates a new bounded connection with the given name and capacity.
pub fn bounded<T>(name: impl Into<String>, capacity: usize) -> (Sender<T>, Receiver<T>) {
    let name = name.into();
    let (tx, rx) = flume::bounded(capacity);
    (
        Sender {
            name: name.clone(),
            inner: tx,
        },
        Receiver { name, inner: rx },
    )
}

impl<T> Sender<T> {
    /// The name of the connection this sender was built for.
    pub fn connection_name(&self) -> &str {
        &self.name
    }

    /// Sends a message, waiting up to `timeout` for room in the channel.
    pub async fn send_timeout(&self, msg: T, timeout: Duration) -> Result<(), Error> {
        match tokio::time::timeout(timeout, self.inner.send_async(msg)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(Error::Closed {
                connection: self.name.clone(),
            }),
            Err(_) => Err(Error::SendTimeout {
                connection: self.name.clone(),
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }

    /// Sends a message without waiting, failing immediately if the channel is
    /// full or closed.
    pub fn try_send(&self, msg: T) -> Result<(), Error> {
        self.inner.try_send(msg).map_err(|_| Error::Closed {
            connection: self.name.clone(),
        })
    }
}

impl<T> Receiver<T> {
    /// The name of the connection this receiver was built for.
    pub fn connection_name(&self) -> &str {
        &self.name
    }

    /// Waits up to `timeout` for the next message.
    pub async fn recv_timeout(&self, timeout: Duration) -> Result<T, Error> {
        match tokio::time::timeout(timeout, self.inner.recv_async()).await {
            Ok(Ok(msg)) => Ok(msg),
            Ok(Err(_)) => Err(Error::Closed {
                connection: self.name.clone(),
            }),
            Err(_) => Err(Error::RecvTimeout {
                connection: self.name.clone(),
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }
}
