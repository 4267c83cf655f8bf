//! rust-tunnel: FakeTCP peer-to-peer tunnel
//!
//! This crate disguises arbitrary IP traffic (TCP, UDP, ICMPv4 and
//! fragments) as a single long-lived TCP flow between a client node on a LAN
//! and a server node on the public internet. The client intercepts traffic
//! from configured sources with raw capture, encapsulates each original IP
//! packet into the flow's byte stream, and the server re-emits it toward the
//! real destination through a NAT layer. Replies travel the same flow back.
//!
//! # Features
//!
//! - **FakeTCP flow**: a pseudo-TCP state machine whose segments look like an
//!   ordinary established connection to middleboxes
//! - **Fragment fidelity**: IPv4 reassembly on capture and refragmentation on
//!   emit, preserving the original IDs and boundaries end to end
//! - **NAT demultiplexing**: per-protocol port pools map replies back to the
//!   right client-side source
//! - **AEAD wrapping**: optional AES-GCM / (X)ChaCha20-Poly1305 encryption of
//!   every encapsulated frame
//!
//! # Architecture
//!
//! ```text
//! Source LAN → listen capture → reassemble → encap → (encrypt)
//!            → FakeTCP segment → upstream inject ⇒ internet ⇒
//!   server capture → decrypt → decap → NAT rewrite → destination
//! ```
//!
//! # Modules
//!
//! - [`capture`]: pcap handles, BPF filters, pump threads
//! - [`config`]: configuration types and loading
//! - [`crypto`]: AEAD wrapper and key derivation
//! - [`device`]: device enumeration, pairing and gateway discovery
//! - [`encap`]: encapsulation frame codec
//! - [`error`]: error types
//! - [`faketcp`]: pseudo-TCP endpoint
//! - [`fragment`]: IPv4 reassembly and refragmentation
//! - [`nat`]: server-side connection tracking
//! - [`packet`]: parsed packet representation and frame codecs
//! - [`tunnel`]: client and server orchestration

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod capture;
pub mod config;
pub mod crypto;
pub mod device;
pub mod encap;
pub mod error;
pub mod faketcp;
pub mod fragment;
pub mod nat;
pub mod packet;
pub mod tunnel;
