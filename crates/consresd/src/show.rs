use std::path::Path;

use consres_core::{ClusterConfig, Granularity};
use consres_select::SavedAllocation;
use consres_state::{BlobHeader, StateFile};

pub fn show_state(config: &ClusterConfig, dir: &Path) -> anyhow::Result<()> {
    let file = StateFile::new(dir);
    let Some((header, jobs)) = file.read_blob()? else {
        println!("no state file at {}", file.path().display());
        return Ok(());
    };
    let current = BlobHeader::current(config.select.granularity);
    println!("{}", format_header(&header, &current));
    for job in &jobs {
        println!("{}", format_job(job));
    }
    Ok(())
}

fn format_header(header: &BlobHeader, current: &BlobHeader) -> String {
    let granularity = Granularity::from_code(header.granularity)
        .map(|g| format!("{g:?}"))
        .unwrap_or_else(|| format!("unknown({})", header.granularity));
    let verdict = if header == current {
        "loadable"
    } else {
        "version mismatch, would start clean"
    };
    format!(
        "{} v{}.{}.{} granularity={} pstate={} ({verdict})",
        header.plugin_name,
        header.plugin_version >> 16,
        (header.plugin_version >> 8) & 0xff,
        header.plugin_version & 0xff,
        granularity,
        header.pstate_version,
    )
}

fn format_job(job: &SavedAllocation) -> String {
    let mut line = format!(
        "job {} procs={} hosts={} class={:?} cpus={:?} alloc={:?} offsets={:?} mem={:?}",
        job.job_id,
        job.nprocs,
        job.nhosts,
        job.node_req,
        job.cpus,
        job.alloc_cpus,
        job.node_offset,
        job.alloc_memory,
    );
    if let Some(cores) = &job.alloc_cores {
        line.push_str(&format!(" cores={cores:?}"));
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use consres_core::NodeState;

    #[test]
    fn header_reports_mismatch() {
        let current = BlobHeader::current(Granularity::CoreMemory);
        assert!(format_header(&current, &current).ends_with("(loadable)"));

        let mut old = current.clone();
        old.pstate_version -= 1;
        let line = format_header(&old, &current);
        assert!(line.starts_with("select/cons_res v"));
        assert!(line.contains("granularity=CoreMemory"));
        assert!(line.contains("would start clean"));
    }

    #[test]
    fn job_line_lists_cores_when_present() {
        let job = SavedAllocation {
            job_id: 4,
            nprocs: 2,
            nhosts: 1,
            node_req: NodeState::Reserved,
            cpus: vec![4],
            alloc_cpus: vec![4],
            node_offset: vec![0],
            alloc_cores: Some(vec![vec![2, 2]]),
            alloc_memory: vec![0],
        };
        let line = format_job(&job);
        assert!(line.starts_with("job 4 procs=2 hosts=1 class=Reserved"));
        assert!(line.ends_with("cores=[[2, 2]]"));
    }
}
