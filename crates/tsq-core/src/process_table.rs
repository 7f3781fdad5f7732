use std::{
    fs, io,
    path::{Path, PathBuf},
    process::Command,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessEntry {
    pub pid: u32,
    pub name: String,
}

/// Source of the host's running processes.
pub trait ProcessTable: Send + Sync {
    fn snapshot(&self) -> io::Result<Vec<ProcessEntry>>;
}

/// Lowest pid whose display name contains any of `names`, case-insensitive.
pub fn lowest_match(entries: &[ProcessEntry], names: &[String], exclude: Option<u32>) -> Option<u32> {
    let needles = names
        .iter()
        .map(|name| name.trim().to_lowercase())
        .filter(|name| !name.is_empty())
        .collect::<Vec<_>>();
    entries
        .iter()
        .filter(|entry| Some(entry.pid) != exclude)
        .filter(|entry| {
            let name = entry.name.to_lowercase();
            needles.iter().any(|needle| name.contains(needle.as_str()))
        })
        .map(|entry| entry.pid)
        .min()
}

#[derive(Debug, Clone)]
pub struct ProcfsTable {
    root: PathBuf,
}

impl Default for ProcfsTable {
    fn default() -> Self {
        Self::with_root("/proc")
    }
}

impl ProcfsTable {
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl ProcessTable for ProcfsTable {
    fn snapshot(&self) -> io::Result<Vec<ProcessEntry>> {
        let mut entries = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let Ok(entry) = entry else {
                continue;
            };
            let Some(pid) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.parse::<u32>().ok())
            else {
                continue;
            };
            // Processes can exit between read_dir and the reads below.
            if let Some(name) = read_display_name(&entry.path()) {
                entries.push(ProcessEntry { pid, name });
            }
        }
        entries.sort_by_key(|entry| entry.pid);
        Ok(entries)
    }
}

fn read_display_name(dir: &Path) -> Option<String> {
    if let Ok(comm) = fs::read_to_string(dir.join("comm")) {
        let comm = comm.trim();
        if !comm.is_empty() {
            return Some(comm.to_string());
        }
    }
    let cmdline = fs::read(dir.join("cmdline")).ok()?;
    let argv0 = cmdline.split(|byte| *byte == 0).next()?;
    let argv0 = String::from_utf8_lossy(argv0);
    let base = Path::new(argv0.as_ref()).file_name()?.to_string_lossy().to_string();
    (!base.is_empty()).then_some(base)
}

/// Falls back to `ps` where there is no procfs.
#[derive(Debug, Clone, Copy, Default)]
pub struct PsTable;

impl ProcessTable for PsTable {
    fn snapshot(&self) -> io::Result<Vec<ProcessEntry>> {
        let output = Command::new("ps").args(["-A", "-o", "pid=,comm="]).output()?;
        if !output.status.success() {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("ps exited with {}", output.status),
            ));
        }
        Ok(parse_ps_output(&String::from_utf8_lossy(&output.stdout)))
    }
}

pub fn parse_ps_output(text: &str) -> Vec<ProcessEntry> {
    text.lines()
        .filter_map(|line| {
            let (pid, name) = line.trim().split_once(char::is_whitespace)?;
            let pid = pid.parse().ok()?;
            let name = name.trim();
            (!name.is_empty()).then(|| ProcessEntry {
                pid,
                name: name.to_string(),
            })
        })
        .collect()
}

#[cfg(target_os = "linux")]
pub type SystemProcessTable = ProcfsTable;

#[cfg(not(target_os = "linux"))]
pub type SystemProcessTable = PsTable;

#[cfg(test)]
mod tests {
    use super::*;

    fn names() -> Vec<String> {
        vec!["ts3client".to_string(), "teamspeak".to_string()]
    }

    fn entry(pid: u32, name: &str) -> ProcessEntry {
        ProcessEntry {
            pid,
            name: name.to_string(),
        }
    }

    #[test]
    fn lowest_matching_pid_wins() {
        let entries = vec![
            entry(900, "ts3client_linux_amd64"),
            entry(40, "bash"),
            entry(120, "TeamSpeak"),
        ];
        assert_eq!(lowest_match(&entries, &names(), None), Some(120));
        assert_eq!(lowest_match(&entries, &names(), Some(120)), Some(900));
        assert_eq!(lowest_match(&entries[1..2], &names(), None), None);
    }

    #[test]
    fn blank_names_never_match() {
        let entries = vec![entry(7, "anything")];
        assert_eq!(lowest_match(&entries, &[" ".to_string()], None), None);
    }

    #[test]
    fn procfs_reads_comm_then_cmdline() {
        let root = tempfile::tempdir().expect("tempdir");
        let write = |pid: &str, file: &str, content: &[u8]| {
            let dir = root.path().join(pid);
            fs::create_dir_all(&dir).expect("mkdir");
            fs::write(dir.join(file), content).expect("write");
        };
        write("30", "comm", b"bash\n");
        write("12", "comm", b"ts3client_linux\n");
        write("7", "cmdline", b"/opt/TeamSpeak/ts3client\0-nosingleinstance\0");
        fs::create_dir_all(root.path().join("self")).expect("mkdir self");

        let table = ProcfsTable::with_root(root.path());
        let entries = table.snapshot().expect("snapshot");
        assert_eq!(
            entries,
            vec![entry(7, "ts3client"), entry(12, "ts3client_linux"), entry(30, "bash")]
        );
        assert_eq!(lowest_match(&entries, &names(), None), Some(7));
    }

    #[test]
    fn ps_output_parses_pid_and_name() {
        let entries = parse_ps_output("    1 init\n  412 /Applications/TeamSpeak 3 Client.app\n garbage\n");
        assert_eq!(
            entries,
            vec![entry(1, "init"), entry(412, "/Applications/TeamSpeak 3 Client.app")]
        );
    }
}
