//! Noise reduction for process-open events.
//!
//! Employee agents report every process that starts, which on a desktop
//! Linux machine is dominated by kernel threads, session daemons and browser
//! helper processes.  Two filters run before anything reaches storage:
//!
//! - [`ProcessFilter`]: a fixed ignore list of system process names plus any
//!   extra names from configuration.  A trailing `*` matches any suffix.
//! - [`ProcessDebouncer`]: per connection, drops repeats of the same name
//!   inside a short window.  It remembers a bounded number of names and
//!   forgets the least recently seen first.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::{Duration, Instant};

/// System processes never worth reporting.
const IGNORED_PROCESSES: &[&str] = &[
    // Kernel threads and low-level
    "kthreadd", "rcu_sched", "rcu_bh", "migration", "ksoftirqd", "kworker",
    "kdevtmpfs", "kauditd", "kswapd", "watchdog", "bioset", "crypto",
    "scsi_eh", "kpsmoused", "ipv6_addrconf", "systemd", "systemd-kthread",
    // Init and base system
    "init", "systemd-journald", "systemd-logind", "systemd-udevd",
    "systemd-timesyncd", "systemd-resolved", "systemd-networkd",
    "upstart", "rsyslogd", "cron", "atd", "dbus-daemon", "login", "agetty",
    "polkitd", "udisksd", "colord", "fwupd", "fwupd-refresh", "rtkit-daemon",
    "accounts-daemon",
    // Device management
    "udevd", "udevadm", "eudev", "devtmpfs", "mdev",
    // Network services
    "sshd", "avahi-daemon", "wpa_supplicant", "NetworkManager", "ModemManager",
    "rpcbind", "nscd", "dnsmasq", "cupsd", "bluetoothd", "nm-dispatcher",
    // Display and session managers
    "gdm", "gdm3", "lightdm", "sddm", "Xorg", "X", "xwayland", "wayland-0",
    "gnome-session", "gnome-session-b", "gnome-shell", "plasmashell",
    "kwin_x11", "kwin_wayland",
    // Audio, settings, keyrings
    "pulseaudio", "pipewire", "pipewire-media-session", "wireplumber",
    "gsettings", "dconf-service", "gnome-keyring-daemon", "gconfd-2",
    "pactl", "pw-cat", "pw-cli",
    // Indexing and virtual file systems
    "tracker-miner-fs", "tracker-store", "tracker-extract", "tracker-miner-apps",
    "tracker-writeback", "gvfsd", "gvfsd-fuse", "gvfs-udisks2-volume-monitor",
    "gvfs-mtp-volume-monitor", "gvfs-gphoto2-volume-monitor",
    "gvfs-afc-volume-monitor", "gvfs-goa-volume-monitor",
    // Accessibility, crypto agents, PIM daemons
    "at-spi-bus-launcher", "at-spi2-registryd", "brltty", "gpg-agent", "gpgv",
    "gpgconf", "seahorse", "evolution-addressbook-factory",
    "evolution-calendar-factory",
    // Sandboxing and portals
    "flatpak", "xdg-document-portal", "xdg-desktop-portal",
    "xdg-permission-store", "bubblewrap", "xdg-settings", "xdg-mime",
    "pingsender", "XdgDesktop", "XdgTerms", "desktop-launch",
    // Snap
    "snap", "snapd", "snap-exec", "snap-confine", "snap-rev", "snap-update",
    "snap-desktop-launch", "snap-seccomp", "snapctl",
    // Containers and virtualization
    "dockerd", "containerd", "runc", "crio", "podman", "lxcfs", "libvirtd",
    "qemu-system-x86_64", "virtlogd", "virtlockd",
    // Desktop background services
    "gnome-software", "update-notifier", "packagekitd", "packagekit",
    "mission-control-5", "telepathy-*", "boltd", "geoclue", "ibus-daemon",
    "ibus-engine-simple", "ibus-x11", "apport", "whoopsie", "kerneloops",
    "apt-key", "apt-config",
    // Browser helper processes (names truncated to 15 chars by the kernel)
    "Web Content", "RDD Process", "Socket Process", "Privileged Cont",
    "Utility Process", "Sandbox", "Isolated Web Co", "Isolated Servic",
    "Forked", "plugin-cont", "WebExtensions", "Sandbox Forked",
    "WebKitNetworkPr", "WebKitWebProces", "glxtest", "MainThread",
    // Short-lived helper noise
    "app", "5", "pigzreader",
];

/// Static ignore list plus configured extras.
#[derive(Debug, Clone)]
pub struct ProcessFilter {
    exact: HashSet<String>,
    prefixes: Vec<String>,
}

impl Default for ProcessFilter {
    fn default() -> Self {
        Self::new(std::iter::empty::<&str>())
    }
}

impl ProcessFilter {
    pub fn new<I, S>(extra: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut exact = HashSet::new();
        let mut prefixes = Vec::new();
        let builtin = IGNORED_PROCESSES.iter().map(|s| s.to_string());
        let configured = extra.into_iter().map(|s| s.as_ref().trim().to_string());
        for pattern in builtin.chain(configured).filter(|p| !p.is_empty()) {
            match pattern.strip_suffix('*') {
                Some(prefix) => prefixes.push(prefix.to_string()),
                None => {
                    exact.insert(pattern);
                }
            }
        }
        Self { exact, prefixes }
    }

    pub fn is_ignored(&self, process: &str) -> bool {
        let process = process.trim();
        self.exact.contains(process) || self.prefixes.iter().any(|p| process.starts_with(p.as_str()))
    }
}

/// Drops repeats of the same process name within `window`.
#[derive(Debug)]
pub struct ProcessDebouncer {
    window: Duration,
    capacity: usize,
    /// name → (last logged at, recency stamp)
    seen: HashMap<String, (Instant, u64)>,
    /// recency stamp → name, oldest first
    order: BTreeMap<u64, String>,
    next_stamp: u64,
}

impl ProcessDebouncer {
    pub fn new(window: Duration, capacity: usize) -> Self {
        Self {
            window,
            capacity: capacity.max(1),
            seen: HashMap::new(),
            order: BTreeMap::new(),
            next_stamp: 0,
        }
    }

    pub fn should_log(&mut self, process: &str) -> bool {
        self.should_log_at(process, Instant::now())
    }

    /// Returns `false` if `process` was logged less than `window` before
    /// `now`.  A logged name becomes the most recently seen one.
    pub fn should_log_at(&mut self, process: &str, now: Instant) -> bool {
        if let Some((last, stamp)) = self.seen.get(process).copied() {
            if now.saturating_duration_since(last) < self.window {
                return false;
            }
            self.order.remove(&stamp);
        }

        let stamp = self.next_stamp;
        self.next_stamp += 1;
        self.seen.insert(process.to_string(), (now, stamp));
        self.order.insert(stamp, process.to_string());

        while self.seen.len() > self.capacity {
            match self.order.pop_first() {
                Some((_, oldest)) => {
                    self.seen.remove(&oldest);
                }
                None => break,
            }
        }
        true
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}
