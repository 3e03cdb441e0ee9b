//! The sender side of a peer link: one worker per subscribed downstream.
//!
//! The worker scans the queue from its cursor, filters by the granted
//! subscription class and the fine-grained ALLOW gates, frames matching
//! products, and writes them to the peer socket. Products reach a single
//! downstream in strict arrival order; the cursor only advances when the
//! peer write succeeded, so a slow socket applies backpressure without
//! touching the queue.

use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

use crate::acl::{AllowEntry, TransferMode};
use crate::class::ProductClass;
use crate::config::PeerConfig;
use crate::control::SignalControl;
use crate::peer::PeerRegistry;
use crate::product::{Product, ProductInfo, Signature};
use crate::queue::{Cursor, NextOutcome, ProductQueue, Wake};
use crate::wire::{read_message, write_message, Message, HEREIS_UNLIMITED};

pub struct UpstreamWorker {
    pub id: u32,
    pub host: String,
    pub queue: Arc<ProductQueue>,
    pub registry: Arc<PeerRegistry>,
    pub control: SignalControl,
    pub class: ProductClass,
    /// Fine-grained `ok`/`not` gates from the matching ALLOW entries.
    pub filter: Vec<AllowEntry>,
    pub mode: TransferMode,
    /// Largest product the peer takes as a single `HereIs`.
    pub max_hereis: u32,
    /// Resume point decoded from the request's trailing signature, if any.
    pub signature_hint: Option<Signature>,
    pub tuning: PeerConfig,
    /// Metadata-only link (`NotifyMe`).
    pub notify_only: bool,
}

impl UpstreamWorker {
    /// Runs the send loop until peer disconnect or shutdown. Consumes the
    /// worker; deregisters on the way out.
    pub fn run(mut self, mut stream: TcpStream) {
        let mut cursor = self.position();
        let interval = Duration::from_secs(self.tuning.suspend_secs);
        let mut sent: u64 = 0;

        'feed: loop {
            if self.control.is_done() {
                break;
            }
            let mut failed = false;
            let outcome = {
                let worker = &self;
                let stream_ref = &mut stream;
                let sent_ref = &mut sent;
                let failed_ref = &mut failed;
                self.queue.next(&mut cursor, &self.class, |info, data| {
                    match worker.offer(stream_ref, info, data) {
                        Ok(true) => {
                            *sent_ref += 1;
                            true
                        }
                        Ok(false) => true, // withheld by the upstream filter
                        Err(err) => {
                            log::info!("peer {} send failed: {}", worker.host, err);
                            *failed_ref = true;
                            false
                        }
                    }
                })
            };
            if failed {
                break;
            }
            match outcome {
                Ok(NextOutcome::Processed { .. }) | Ok(NextOutcome::Corrupt) => {}
                Ok(NextOutcome::EndOfQueue) => {
                    match self
                        .queue
                        .suspend(&mut cursor, interval, Some(&self.control))
                    {
                        Wake::Overrun => {
                            log::warn!(
                                "peer {} fell behind; oldest products were reclaimed",
                                self.host
                            );
                        }
                        Wake::Interrupted if self.control.is_done() => break 'feed,
                        Wake::NewData | Wake::Timeout | Wake::Interrupted => {}
                    }
                }
                Err(err) => {
                    log::error!("queue scan for peer {} failed: {}", self.host, err);
                    break;
                }
            }
        }

        log::info!(
            "feed to {} finished after {} products",
            self.host,
            sent
        );
        let _unused = stream.shutdown(std::net::Shutdown::Both);
        self.registry.deregister(self.id);
    }

    /// Initial cursor: the hinted product's position, else the beginning.
    fn position(&mut self) -> Cursor {
        if let Some(sig) = self.signature_hint.take() {
            match self.queue.cursor_from_signature(&sig) {
                Ok(Some(cursor)) => {
                    log::debug!("peer {} resumes after {}", self.host, sig);
                    return cursor;
                }
                Ok(None) => {
                    log::info!(
                        "peer {} hinted at unknown signature {}; starting from the beginning",
                        self.host,
                        sig
                    );
                }
                Err(err) => log::error!("signature lookup failed: {}", err),
            }
        }
        Cursor::zero()
    }

    /// Returns `Ok(true)` when the product went out, `Ok(false)` when the
    /// ALLOW gates withheld it.
    fn offer(
        &self,
        stream: &mut TcpStream,
        info: &ProductInfo,
        data: &[u8],
    ) -> Result<bool, crate::wire::WireError> {
        if !self.filter.is_empty() && !self.filter.iter().any(|entry| entry.permits(info)) {
            log::debug!("withholding {} from {}", info.ident, self.host);
            return Ok(false);
        }
        if self.notify_only {
            write_message(
                stream,
                &Message::Notification { info: info.clone() },
            )?;
            return Ok(true);
        }
        let whole = self.mode == TransferMode::Primary
            && (self.max_hereis == HEREIS_UNLIMITED || info.size <= self.max_hereis);
        if whole {
            write_message(
                stream,
                &Message::HereIs {
                    product: Product {
                        info: info.clone(),
                        data: data.to_vec(),
                    },
                },
            )?;
            return Ok(true);
        }
        self.offer_blocks(stream, info, data)
    }

    /// Alternate mode: announce, await consent, stream blocks.
    fn offer_blocks(
        &self,
        stream: &mut TcpStream,
        info: &ProductInfo,
        data: &[u8],
    ) -> Result<bool, crate::wire::WireError> {
        write_message(
            stream,
            &Message::ComingSoon {
                info: info.clone(),
                size: info.size,
            },
        )?;
        match read_message(stream)? {
            Message::DontSend => {
                log::debug!("{} declined {}", self.host, info.ident);
                return Ok(true);
            }
            Message::Ok { .. } => {}
            other => {
                log::warn!("unexpected reply to announcement: {:?}", other);
                return Ok(true);
            }
        }
        let chunk = self.tuning.blkdata_chunk.max(1);
        let mut offset = 0usize;
        while offset < data.len() {
            let end = (offset + chunk).min(data.len());
            write_message(
                stream,
                &Message::BlkData {
                    signature: info.signature,
                    offset: offset as u32,
                    data: data[offset..end].to_vec(),
                },
            )?;
            offset = end;
        }
        // Zero-length products still announce; send one empty block so the
        // receiver completes assembly.
        if data.is_empty() {
            write_message(
                stream,
                &Message::BlkData {
                    signature: info.signature,
                    offset: 0,
                    data: vec![],
                },
            )?;
        }
        Ok(true)
    }
}
