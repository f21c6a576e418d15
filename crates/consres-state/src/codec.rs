//! Binary layout of the state blob.
//!
//! ```text
//! name_len u32 | name bytes | plugin_version u32 | granularity u16
//! pstate_version u32 | job_count u16 | job records...
//!
//! job record:
//!   job_id u32 | nprocs u32 | nhosts u32 | class u16
//!   cpus [u16] | alloc_cpus [u16] | node_offset [u16]
//!   per_socket u16 | per host when set: sockets u16, cores [u16]
//!   alloc_memory [u32]
//! ```
//!
//! `[T]` is a u32 element count followed by the elements. All integers are
//! little-endian.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use consres_core::{Granularity, NodeState};
use consres_select::SavedAllocation;

use crate::error::{StateError, StateResult};

pub const PLUGIN_NAME: &str = "select/cons_res";

/// Bumped whenever the job record layout changes.
pub const PSTATE_VERSION: u32 = 7;

/// `major << 16 | minor << 8 | patch` of this crate's version.
pub fn plugin_version() -> u32 {
    semver::Version::parse(env!("CARGO_PKG_VERSION"))
        .map(|v| ((v.major as u32) << 16) | ((v.minor as u32 & 0xff) << 8) | (v.patch as u32 & 0xff))
        .unwrap_or(0)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobHeader {
    pub plugin_name: String,
    pub plugin_version: u32,
    pub granularity: u16,
    pub pstate_version: u32,
}

impl BlobHeader {
    /// Header the running code writes and accepts.
    pub fn current(granularity: Granularity) -> Self {
        Self {
            plugin_name: PLUGIN_NAME.to_string(),
            plugin_version: plugin_version(),
            granularity: granularity.code(),
            pstate_version: PSTATE_VERSION,
        }
    }
}

pub fn encode(header: &BlobHeader, jobs: &[SavedAllocation]) -> StateResult<Bytes> {
    let mut buf = BytesMut::with_capacity(64 + jobs.len() * 64);
    put_len(&mut buf, header.plugin_name.len())?;
    buf.put_slice(header.plugin_name.as_bytes());
    buf.put_u32_le(header.plugin_version);
    buf.put_u16_le(header.granularity);
    buf.put_u32_le(header.pstate_version);
    let count = u16::try_from(jobs.len())
        .map_err(|_| StateError::Overflow(format!("{} jobs", jobs.len())))?;
    buf.put_u16_le(count);

    for job in jobs {
        buf.put_u32_le(job.job_id);
        buf.put_u32_le(job.nprocs);
        buf.put_u32_le(job.nhosts);
        buf.put_u16_le(job.node_req.code());
        put_u16s(&mut buf, &job.cpus)?;
        put_u16s(&mut buf, &job.alloc_cpus)?;
        put_u16s(&mut buf, &job.node_offset)?;
        match &job.alloc_cores {
            Some(hosts) => {
                buf.put_u16_le(1);
                for cores in hosts {
                    let sockets = u16::try_from(cores.len())
                        .map_err(|_| StateError::Overflow(format!("{} sockets", cores.len())))?;
                    buf.put_u16_le(sockets);
                    put_u16s(&mut buf, cores)?;
                }
            }
            None => buf.put_u16_le(0),
        }
        put_len(&mut buf, job.alloc_memory.len())?;
        for mem in &job.alloc_memory {
            buf.put_u32_le(*mem);
        }
    }
    Ok(buf.freeze())
}

pub fn decode_header(buf: &mut Bytes) -> StateResult<BlobHeader> {
    let len = get_len(buf, "plugin name length")?;
    need(buf, len, "plugin name")?;
    let name = buf.split_to(len);
    let plugin_name = String::from_utf8(name.to_vec())
        .map_err(|_| StateError::Invalid("plugin name is not utf-8".into()))?;
    need(buf, 10, "header")?;
    Ok(BlobHeader {
        plugin_name,
        plugin_version: buf.get_u32_le(),
        granularity: buf.get_u16_le(),
        pstate_version: buf.get_u32_le(),
    })
}

/// Decode a whole blob. `Ok(None)` when any version field differs from the
/// running code, in which case the caller starts clean.
pub fn decode(mut buf: Bytes, granularity: Granularity) -> StateResult<Option<Vec<SavedAllocation>>> {
    let header = decode_header(&mut buf)?;
    if header != BlobHeader::current(granularity) {
        return Ok(None);
    }
    decode_jobs(&mut buf).map(Some)
}

/// Job records following the header.
pub fn decode_jobs(buf: &mut Bytes) -> StateResult<Vec<SavedAllocation>> {
    need(buf, 2, "job count")?;
    let count = buf.get_u16_le();
    let mut jobs = Vec::with_capacity(usize::from(count));
    for _ in 0..count {
        need(buf, 14, "job header")?;
        let job_id = buf.get_u32_le();
        let nprocs = buf.get_u32_le();
        let nhosts = buf.get_u32_le();
        let class = buf.get_u16_le();
        let node_req = NodeState::from_code(class)
            .ok_or_else(|| StateError::Invalid(format!("job {job_id}: node request class {class}")))?;
        let cpus = get_u16s(buf, "cpus")?;
        let alloc_cpus = get_u16s(buf, "alloc_cpus")?;
        let node_offset = get_u16s(buf, "node_offset")?;
        if cpus.len() != nhosts as usize {
            return Err(StateError::Invalid(format!(
                "job {job_id}: {} cpu counts for {nhosts} hosts",
                cpus.len()
            )));
        }

        need(buf, 2, "per-socket flag")?;
        let alloc_cores = if buf.get_u16_le() != 0 {
            let mut hosts = Vec::with_capacity(cpus.len().min(buf.remaining() / 6));
            for _ in 0..cpus.len() {
                need(buf, 2, "socket count")?;
                let sockets = buf.get_u16_le();
                let cores = get_u16s(buf, "alloc_cores")?;
                if cores.len() != usize::from(sockets) {
                    return Err(StateError::Invalid(format!(
                        "job {job_id}: {} core counters for {sockets} sockets",
                        cores.len()
                    )));
                }
                hosts.push(cores);
            }
            Some(hosts)
        } else {
            None
        };

        let mem_len = get_len(buf, "alloc_memory length")?;
        need(buf, mem_len * 4, "alloc_memory")?;
        let alloc_memory = (0..mem_len).map(|_| buf.get_u32_le()).collect();

        jobs.push(SavedAllocation {
            job_id,
            nprocs,
            nhosts,
            node_req,
            cpus,
            alloc_cpus,
            node_offset,
            alloc_cores,
            alloc_memory,
        });
    }
    Ok(jobs)
}

fn need(buf: &Bytes, n: usize, what: &'static str) -> StateResult<()> {
    if buf.remaining() < n {
        return Err(StateError::Truncated(what));
    }
    Ok(())
}

fn put_len(buf: &mut BytesMut, len: usize) -> StateResult<()> {
    let len = u32::try_from(len).map_err(|_| StateError::Overflow(format!("array of {len}")))?;
    buf.put_u32_le(len);
    Ok(())
}

fn get_len(buf: &mut Bytes, what: &'static str) -> StateResult<usize> {
    need(buf, 4, what)?;
    Ok(buf.get_u32_le() as usize)
}

fn put_u16s(buf: &mut BytesMut, values: &[u16]) -> StateResult<()> {
    put_len(buf, values.len())?;
    for v in values {
        buf.put_u16_le(*v);
    }
    Ok(())
}

fn get_u16s(buf: &mut Bytes, what: &'static str) -> StateResult<Vec<u16>> {
    let len = get_len(buf, what)?;
    need(buf, len * 2, what)?;
    Ok((0..len).map(|_| buf.get_u16_le()).collect())
}
