//! The ordered trace header (§4.4): identifier → version → comments →
//! ISA → IEM → optional ISA extension → force-PC → trace-info →
//! feature-flags → optional process id → optional vlen → end-of-header.

use crate::byte_stream::{ReadStream, WriteStream};
use crate::enums::{InstIem, Isa, TraceFeatures};
use crate::error::{Result, StfError};
use crate::record::{self, unpack_full, IsaExtended, ProcessIdExt, Record, TraceInfo};

pub const CURRENT_MAJOR: u32 = 1;
pub const CURRENT_MINOR: u32 = 5;
pub const MIN_SUPPORTED_MAJOR: u32 = 0;
pub const MIN_SUPPORTED_MINOR: u32 = 8;

/// Fully parsed header content, returned by [`read_header`].
#[derive(Debug, Clone)]
pub struct HeaderInfo {
    pub version: (u32, u32),
    pub comments: Vec<String>,
    pub isa: Isa,
    pub iem: InstIem,
    pub isa_extended: Option<IsaExtended>,
    pub force_pc: u64,
    pub trace_infos: Vec<TraceInfo>,
    pub features: TraceFeatures,
    pub process_id: Option<ProcessIdExt>,
    pub vlen: Option<u32>,
}

fn check_version(major: u32, minor: u32) -> Result<()> {
    if major > CURRENT_MAJOR || (major == CURRENT_MAJOR && minor > CURRENT_MINOR) {
        return Err(StfError::UnsupportedVersion(major, minor));
    }
    if major < MIN_SUPPORTED_MAJOR || (major == MIN_SUPPORTED_MAJOR && minor < MIN_SUPPORTED_MINOR)
    {
        return Err(StfError::UnsupportedVersion(major, minor));
    }
    Ok(())
}

/// Reads and validates the ordered header, per the table in §4.4. Any
/// record appearing out of place, or an EOF before `EndOfHeader`, is a
/// protocol violation.
pub fn read_header<R: std::io::Read>(r: &mut ReadStream<R>) -> Result<HeaderInfo> {
    let rec = unpack_full(r).map_err(|_| StfError::IncompleteHeader("identifier"))?;
    match rec {
        Record::Identifier => {}
        _ => return Err(StfError::NotAnStfFile),
    }

    let rec = unpack_full(r).map_err(|_| StfError::IncompleteHeader("version"))?;
    let (major, minor) = match rec {
        Record::Version { major, minor } => (major, minor),
        _ => return Err(StfError::HeaderOrderViolation("expected Version after Identifier")),
    };
    check_version(major, minor)?;

    let mut comments = Vec::new();
    let mut isa = None;
    let mut iem = None;
    let mut isa_extended = None;
    let mut force_pc = None;
    let mut trace_infos = Vec::new();
    let mut features = None;
    let mut process_id = None;
    let mut vlen = None;

    loop {
        let rec = unpack_full(r).map_err(|_| StfError::IncompleteHeader("header body"))?;
        match rec {
            Record::Comment(text) => {
                if isa.is_some() {
                    return Err(StfError::HeaderOrderViolation(
                        "comments must precede all other header records",
                    ));
                }
                comments.push(text);
            }
            Record::Isa(v) => {
                if isa.is_some() {
                    return Err(StfError::HeaderOrderViolation("duplicate ISA record"));
                }
                isa = Some(v);
            }
            Record::InstIem(v) => {
                if isa.is_none() || iem.is_some() {
                    return Err(StfError::HeaderOrderViolation("InstIEM must follow ISA, exactly once"));
                }
                iem = Some(v);
            }
            Record::IsaExtended(v) => {
                if iem.is_none() || isa_extended.is_some() {
                    return Err(StfError::HeaderOrderViolation(
                        "IsaExtended must follow InstIEM, at most once",
                    ));
                }
                isa_extended = Some(v);
            }
            Record::ForcePc(addr) => {
                if iem.is_none() || force_pc.is_some() {
                    return Err(StfError::HeaderOrderViolation("ForcePC must follow InstIEM, exactly once"));
                }
                force_pc = Some(addr);
            }
            Record::TraceInfo(info) => {
                if force_pc.is_none() {
                    return Err(StfError::HeaderOrderViolation("TraceInfo must follow ForcePC"));
                }
                trace_infos.push(info);
            }
            Record::TraceInfoFeature(f) => {
                if trace_infos.is_empty() || features.is_some() {
                    return Err(StfError::HeaderOrderViolation(
                        "TraceInfoFeature requires >=1 TraceInfo already written, exactly once",
                    ));
                }
                features = Some(f);
            }
            Record::ProcessIdExt(p) => {
                if features.is_none() || process_id.is_some() {
                    return Err(StfError::HeaderOrderViolation(
                        "ProcessIDExt must follow TraceInfoFeature, at most once",
                    ));
                }
                process_id = Some(p);
            }
            Record::VLenConfig(v) => {
                if features.is_none() || vlen.is_some() {
                    return Err(StfError::HeaderOrderViolation("VLenConfig must follow TraceInfoFeature, at most once"));
                }
                vlen = Some(v);
                r.ctx.vlen = Some(v);
            }
            Record::EndOfHeader => {
                let isa = isa.ok_or(StfError::IncompleteHeader("missing ISA"))?;
                let iem = iem.ok_or(StfError::IncompleteHeader("missing InstIEM"))?;
                let force_pc = force_pc.ok_or(StfError::IncompleteHeader("missing ForcePC"))?;
                if trace_infos.is_empty() {
                    return Err(StfError::IncompleteHeader("missing TraceInfo"));
                }
                let features = features.ok_or(StfError::IncompleteHeader("missing TraceInfoFeature"))?;
                r.ctx.pc_tracker.force(force_pc);
                return Ok(HeaderInfo {
                    version: (major, minor),
                    comments,
                    isa,
                    iem,
                    isa_extended,
                    force_pc,
                    trace_infos,
                    features,
                    process_id,
                    vlen,
                });
            }
            _ => return Err(StfError::HeaderOrderViolation("unexpected record in header")),
        }
    }
}

/// Incrementally-built header state, mirroring the writer's phase latches
/// (§4.4): `flush` emits whatever blocks are ready, in order; `finalize`
/// requires all mandatory blocks to have been set and emits the trailing
/// `EndOfHeader`.
#[derive(Debug, Default)]
pub struct HeaderWriter {
    comments: Vec<String>,
    comments_written: bool,
    isa: Option<Isa>,
    isa_written: bool,
    iem: Option<InstIem>,
    iem_written: bool,
    isa_extended: Option<IsaExtended>,
    isa_extended_written: bool,
    force_pc: Option<u64>,
    force_pc_written: bool,
    trace_infos: Vec<TraceInfo>,
    trace_info_written: bool,
    features: Option<TraceFeatures>,
    features_written: bool,
    process_id: Option<ProcessIdExt>,
    process_id_written: bool,
    vlen: Option<u32>,
    vlen_written: bool,
    identity_written: bool,
}

impl HeaderWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_comment(&mut self, comment: impl Into<String>) -> &mut Self {
        self.comments.push(comment.into());
        self
    }

    pub fn set_isa(&mut self, isa: Isa) -> &mut Self {
        self.isa = Some(isa);
        self
    }

    pub fn set_iem(&mut self, iem: InstIem) -> &mut Self {
        self.iem = Some(iem);
        self
    }

    pub fn set_isa_extended(&mut self, ext: IsaExtended) -> &mut Self {
        self.isa_extended = Some(ext);
        self
    }

    pub fn set_force_pc(&mut self, addr: u64) -> &mut Self {
        self.force_pc = Some(addr);
        self
    }

    pub fn add_trace_info(&mut self, info: TraceInfo) -> &mut Self {
        self.trace_infos.push(info);
        self
    }

    pub fn set_features(&mut self, features: TraceFeatures) -> &mut Self {
        self.features = Some(features);
        self
    }

    pub fn set_process_id(&mut self, pid: ProcessIdExt) -> &mut Self {
        self.process_id = Some(pid);
        self
    }

    pub fn set_vlen(&mut self, vlen: u32) -> &mut Self {
        self.vlen = Some(vlen);
        self
    }

    /// Emits every block whose content is set but not yet written, in
    /// header order, asserting each block's prerequisite latch.
    pub fn flush<W: std::io::Write>(&mut self, w: &mut WriteStream<W>) -> Result<()> {
        if !self.identity_written {
            record::pack_full(&Record::Identifier, w)?;
            record::pack_full(
                &Record::Version {
                    major: CURRENT_MAJOR,
                    minor: CURRENT_MINOR,
                },
                w,
            )?;
            self.identity_written = true;
        }
        if !self.comments_written && !self.comments.is_empty() {
            for comment in &self.comments {
                record::pack_full(&Record::Comment(comment.clone()), w)?;
            }
            self.comments_written = true;
        }
        if !self.isa_written {
            let isa = match self.isa {
                Some(isa) => isa,
                None => return Ok(()),
            };
            record::pack_full(&Record::Isa(isa), w)?;
            self.isa_written = true;
        }
        if !self.iem_written {
            let iem = match self.iem {
                Some(iem) => iem,
                None => return Ok(()),
            };
            record::pack_full(&Record::InstIem(iem), w)?;
            self.iem_written = true;
        }
        if !self.isa_extended_written {
            match self.isa_extended.take() {
                Some(ext) => {
                    record::pack_full(&Record::IsaExtended(ext), w)?;
                    self.isa_extended_written = true;
                }
                None => {}
            }
        }
        if !self.force_pc_written {
            let addr = match self.force_pc {
                Some(addr) => addr,
                None => return Ok(()),
            };
            record::pack_full(&Record::ForcePc(addr), w)?;
            w.ctx.pc_tracker.force(addr);
            self.force_pc_written = true;
        }
        if !self.trace_info_written && !self.trace_infos.is_empty() {
            for info in &self.trace_infos {
                record::pack_full(&Record::TraceInfo(info.clone()), w)?;
            }
            self.trace_info_written = true;
        }
        if !self.features_written {
            if !self.trace_info_written {
                return Ok(());
            }
            let features = match self.features {
                Some(f) => f,
                None => return Ok(()),
            };
            record::pack_full(&Record::TraceInfoFeature(features), w)?;
            self.features_written = true;
        }
        if !self.process_id_written {
            if let Some(pid) = self.process_id.take() {
                record::pack_full(&Record::ProcessIdExt(pid), w)?;
                self.process_id_written = true;
            }
        }
        if !self.vlen_written {
            if let Some(vlen) = self.vlen {
                record::pack_full(&Record::VLenConfig(vlen), w)?;
                w.ctx.vlen = Some(vlen);
                self.vlen_written = true;
            }
        }
        Ok(())
    }

    /// Flushes any unwritten blocks in order and emits `EndOfHeader`.
    /// Errors if a mandatory block (ISA, IEM, ForcePC, TraceInfo, features)
    /// was never set.
    pub fn finalize<W: std::io::Write>(&mut self, w: &mut WriteStream<W>) -> Result<()> {
        self.flush(w)?;
        if !self.isa_written {
            return Err(StfError::IncompleteHeader("ISA was never set"));
        }
        if !self.iem_written {
            return Err(StfError::IncompleteHeader("InstIEM was never set"));
        }
        if !self.force_pc_written {
            return Err(StfError::IncompleteHeader("ForcePC was never set"));
        }
        if !self.trace_info_written {
            return Err(StfError::IncompleteHeader("TraceInfo was never set"));
        }
        if !self.features_written {
            return Err(StfError::IncompleteHeader("TraceInfoFeature was never set"));
        }
        record::pack_full(&Record::EndOfHeader, w)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trips() {
        let mut buf = Vec::new();
        {
            let mut w = WriteStream::new(&mut buf);
            let mut hw = HeaderWriter::new();
            hw.set_isa(Isa::RiscV)
                .set_iem(InstIem::Rv64)
                .set_force_pc(0x1000)
                .add_trace_info(TraceInfo {
                    generator: crate::enums::Generator::Qemu,
                    major: 1,
                    minor: 0,
                    minor_minor: 0,
                    comment: "test".into(),
                })
                .set_features(TraceFeatures::RV64 | TraceFeatures::PHYSICAL_ADDRESS);
            hw.finalize(&mut w).unwrap();
        }
        let mut r = ReadStream::new(&buf[..]);
        let info = read_header(&mut r).unwrap();
        assert_eq!(info.isa, Isa::RiscV);
        assert_eq!(info.iem, InstIem::Rv64);
        assert_eq!(info.force_pc, 0x1000);
        assert_eq!(info.trace_infos.len(), 1);
        assert!(info.features.contains(TraceFeatures::RV64));
        assert!(r.ctx.pc_tracker.pc() == 0 && info.force_pc == 0x1000);
    }

    #[test]
    fn incomplete_header_missing_force_pc() {
        let mut buf = Vec::new();
        let mut w = WriteStream::new(&mut buf);
        let mut hw = HeaderWriter::new();
        hw.set_isa(Isa::RiscV).set_iem(InstIem::Rv64);
        assert!(hw.finalize(&mut w).is_err());
    }

    #[test]
    fn rejects_newer_version() {
        let mut buf = Vec::new();
        {
            let mut w = WriteStream::new(&mut buf);
            record::pack_full(&Record::Identifier, &mut w).unwrap();
            record::pack_full(
                &Record::Version {
                    major: CURRENT_MAJOR + 1,
                    minor: 0,
                },
                &mut w,
            )
            .unwrap();
        }
        let mut r = ReadStream::new(&buf[..]);
        let err = read_header(&mut r).unwrap_err();
        assert!(matches!(err, StfError::UnsupportedVersion(_, _)));
    }
}
