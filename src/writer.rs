//! The intra-instruction ordering state machine (§4.5), grounded on
//! `stf_writer_base.hpp`'s ordering assertions (`original_source/`).
//!
//! Post-header, records must appear in strictly non-decreasing
//! [`Descriptor`] order, except for a short documented list of
//! exceptions (pair restarts, and a couple of inversions that the
//! chosen discriminant ordering already makes non-decreasing, listed
//! here only for clarity). Violating the order, leaving an access
//! record without its content, writing outside the current phase, or
//! writing a reserved descriptor is a programmer error and is asserted
//! against rather than silently tolerated.

use std::io::Write;

use crate::byte_stream::WriteStream;
use crate::descriptor::Descriptor;
use crate::error::{Result, StfError};
use crate::header::HeaderWriter;
use crate::record::{self, Record};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Header,
    Body,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingPair {
    None,
    /// An `InstMemAccess`/`BusMasterAccess` was written; its content
    /// record must follow before any other descriptor is legal.
    AwaitingContent(Descriptor),
}

/// Drives a [`WriteStream`] through the header then the ordered body,
/// rejecting anything that violates §4.5.
pub struct Writer<W> {
    stream: WriteStream<W>,
    header: HeaderWriter,
    phase: Phase,
    last_descriptor: Option<Descriptor>,
    pending: PendingPair,
    marker_count: u64,
}

impl<W: Write> Writer<W> {
    pub fn new(inner: W) -> Self {
        Self {
            stream: WriteStream::new(inner),
            header: HeaderWriter::new(),
            phase: Phase::Header,
            last_descriptor: None,
            pending: PendingPair::None,
            marker_count: 0,
        }
    }

    /// Mutable access to the in-progress header, for the `set_*`/`add_*`
    /// builder calls before [`finalize_header`](Self::finalize_header).
    pub fn header_mut(&mut self) -> &mut HeaderWriter {
        &mut self.header
    }

    /// Closes the header phase. After this, only body records are legal.
    pub fn finalize_header(&mut self) -> Result<()> {
        if self.phase != Phase::Header {
            return Err(StfError::WriterOrderViolation("header already finalized"));
        }
        self.header.finalize(&mut self.stream)?;
        self.phase = Phase::Body;
        Ok(())
    }

    pub fn marker_count(&self) -> u64 {
        self.marker_count
    }

    pub fn into_inner(self) -> W {
        self.stream.into_inner()
    }

    /// Writes a single body record, enforcing ordering (§4.5). Returns
    /// `Ok(true)` if this record closed an instruction group (an
    /// opcode marker), at which point callers drive chunking (§4.2).
    pub fn write_record(&mut self, record: &Record) -> Result<bool> {
        if self.phase != Phase::Body {
            return Err(StfError::WriterOrderViolation(
                "instruction records are not legal before the header is finalized",
            ));
        }

        let descriptor = record.descriptor();
        if descriptor.is_header_record() && descriptor != Descriptor::Comment {
            return Err(StfError::WriterOrderViolation(
                "header records are not legal after finalize_header",
            ));
        }

        if let PendingPair::AwaitingContent(expected) = self.pending {
            let is_content = matches!(
                (expected, descriptor),
                (Descriptor::InstMemAccess, Descriptor::InstMemContent)
                    | (Descriptor::BusMasterAccess, Descriptor::BusMasterContent)
            );
            if !is_content {
                return Err(StfError::MissingMemContent);
            }
        }

        self.check_order(descriptor)?;
        record::pack_full(record, &mut self.stream)?;
        if descriptor != Descriptor::Comment {
            self.last_descriptor = Some(descriptor);
        }

        self.pending = match descriptor {
            Descriptor::InstMemAccess | Descriptor::BusMasterAccess => {
                PendingPair::AwaitingContent(descriptor)
            }
            _ => PendingPair::None,
        };

        if descriptor.is_marker() {
            self.marker_count += 1;
            self.last_descriptor = None;
            return Ok(true);
        }
        Ok(false)
    }

    fn check_order(&self, descriptor: Descriptor) -> Result<()> {
        if descriptor == Descriptor::Comment {
            return Ok(());
        }
        let last = match self.last_descriptor {
            Some(d) => d,
            None => return Ok(()),
        };
        if descriptor >= last {
            return Ok(());
        }
        // Exceptions: restarting a paired access/content or an event
        // group after its target goes "backwards" in descriptor order.
        let restarts_pair = matches!(
            (last, descriptor),
            (Descriptor::InstMemContent, Descriptor::InstMemAccess)
                | (Descriptor::BusMasterContent, Descriptor::BusMasterAccess)
                | (Descriptor::EventPcTarget, Descriptor::Event)
        );
        if restarts_pair {
            return Ok(());
        }
        // PageTableWalk -> InstReg is the one documented true inversion.
        if last == Descriptor::PageTableWalk && descriptor == Descriptor::InstReg {
            return Ok(());
        }
        Err(StfError::WriterOrderViolation(
            "record descriptor is out of the required non-decreasing order",
        ))
    }

    pub fn flush(&mut self) -> Result<()> {
        self.stream.flush()
    }
}
