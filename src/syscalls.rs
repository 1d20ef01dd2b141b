//! Syscall decoder
//!
//! Maps `(arch, syscall_nr)` to a name and formal argument list, and
//! renders one-line human descriptions of syscall entries and returns for
//! the logging hooks. The table is the crate's embedded rendering of the
//! Linux x86-64 syscall surface; numbers the table does not know format as
//! `syscall_<nr>` with their arguments passed through unchanged.

use std::collections::HashMap;

use once_cell::sync::Lazy;

/// Name and formal argument list of one syscall
#[derive(Debug, Clone, Copy)]
pub struct SyscallDef {
    pub name: &'static str,
    pub args: &'static [&'static str],
}

type Table = &'static [(i64, &'static str, &'static [&'static str])];

#[rustfmt::skip]
static X86_64: Table = &[
    (0, "read", &["fd", "buf", "count"]),
    (1, "write", &["fd", "buf", "count"]),
    (2, "open", &["filename", "flags", "mode"]),
    (3, "close", &["fd"]),
    (4, "stat", &["filename", "statbuf"]),
    (5, "fstat", &["fd", "statbuf"]),
    (6, "lstat", &["filename", "statbuf"]),
    (7, "poll", &["ufds", "nfds", "timeout"]),
    (8, "lseek", &["fd", "offset", "whence"]),
    (9, "mmap", &["addr", "len", "prot", "flags", "fd", "off"]),
    (10, "mprotect", &["start", "len", "prot"]),
    (11, "munmap", &["addr", "len"]),
    (12, "brk", &["brk"]),
    (13, "rt_sigaction", &["sig", "act", "oact", "sigsetsize"]),
    (14, "rt_sigprocmask", &["how", "nset", "oset", "sigsetsize"]),
    (15, "rt_sigreturn", &[]),
    (16, "ioctl", &["fd", "cmd", "arg"]),
    (17, "pread64", &["fd", "buf", "count", "pos"]),
    (18, "pwrite64", &["fd", "buf", "count", "pos"]),
    (19, "readv", &["fd", "vec", "vlen"]),
    (20, "writev", &["fd", "vec", "vlen"]),
    (21, "access", &["filename", "mode"]),
    (22, "pipe", &["fildes"]),
    (23, "select", &["n", "inp", "outp", "exp", "tvp"]),
    (24, "sched_yield", &[]),
    (25, "mremap", &["addr", "old_len", "new_len", "flags", "new_addr"]),
    (26, "msync", &["start", "len", "flags"]),
    (27, "mincore", &["start", "len", "vec"]),
    (28, "madvise", &["start", "len", "behavior"]),
    (32, "dup", &["fildes"]),
    (33, "dup2", &["oldfd", "newfd"]),
    (34, "pause", &[]),
    (35, "nanosleep", &["rqtp", "rmtp"]),
    (37, "alarm", &["seconds"]),
    (39, "getpid", &[]),
    (41, "socket", &["family", "type", "protocol"]),
    (42, "connect", &["fd", "uservaddr", "addrlen"]),
    (43, "accept", &["fd", "upeer_sockaddr", "upeer_addrlen"]),
    (44, "sendto", &["fd", "buff", "len", "flags", "addr", "addr_len"]),
    (45, "recvfrom", &["fd", "ubuf", "size", "flags", "addr", "addr_len"]),
    (46, "sendmsg", &["fd", "msg", "flags"]),
    (47, "recvmsg", &["fd", "msg", "flags"]),
    (48, "shutdown", &["fd", "how"]),
    (49, "bind", &["fd", "umyaddr", "addrlen"]),
    (50, "listen", &["fd", "backlog"]),
    (51, "getsockname", &["fd", "usockaddr", "usockaddr_len"]),
    (52, "getpeername", &["fd", "usockaddr", "usockaddr_len"]),
    (53, "socketpair", &["family", "type", "protocol", "usockvec"]),
    (54, "setsockopt", &["fd", "level", "optname", "optval", "optlen"]),
    (55, "getsockopt", &["fd", "level", "optname", "optval", "optlen"]),
    (56, "clone", &["clone_flags", "newsp", "parent_tid", "child_tid", "tls"]),
    (57, "fork", &[]),
    (58, "vfork", &[]),
    (59, "execve", &["filename", "argv", "envp"]),
    (60, "exit", &["error_code"]),
    (61, "wait4", &["upid", "stat_addr", "options", "ru"]),
    (62, "kill", &["pid", "sig"]),
    (63, "uname", &["name"]),
    (72, "fcntl", &["fd", "cmd", "arg"]),
    (73, "flock", &["fd", "cmd"]),
    (74, "fsync", &["fd"]),
    (75, "fdatasync", &["fd"]),
    (76, "truncate", &["path", "length"]),
    (77, "ftruncate", &["fd", "length"]),
    (78, "getdents", &["fd", "dirent", "count"]),
    (79, "getcwd", &["buf", "size"]),
    (80, "chdir", &["filename"]),
    (81, "fchdir", &["fd"]),
    (82, "rename", &["oldname", "newname"]),
    (83, "mkdir", &["pathname", "mode"]),
    (84, "rmdir", &["pathname"]),
    (85, "creat", &["pathname", "mode"]),
    (86, "link", &["oldname", "newname"]),
    (87, "unlink", &["pathname"]),
    (88, "symlink", &["oldname", "newname"]),
    (89, "readlink", &["path", "buf", "bufsiz"]),
    (90, "chmod", &["filename", "mode"]),
    (91, "fchmod", &["fd", "mode"]),
    (92, "chown", &["filename", "user", "group"]),
    (93, "fchown", &["fd", "user", "group"]),
    (95, "umask", &["mask"]),
    (96, "gettimeofday", &["tv", "tz"]),
    (97, "getrlimit", &["resource", "rlim"]),
    (98, "getrusage", &["who", "ru"]),
    (99, "sysinfo", &["info"]),
    (100, "times", &["tbuf"]),
    (102, "getuid", &[]),
    (104, "getgid", &[]),
    (105, "setuid", &["uid"]),
    (106, "setgid", &["gid"]),
    (107, "geteuid", &[]),
    (108, "getegid", &[]),
    (109, "setpgid", &["pid", "pgid"]),
    (110, "getppid", &[]),
    (111, "getpgrp", &[]),
    (112, "setsid", &[]),
    (131, "sigaltstack", &["uss", "uoss"]),
    (137, "statfs", &["pathname", "buf"]),
    (138, "fstatfs", &["fd", "buf"]),
    (158, "arch_prctl", &["option", "arg2"]),
    (160, "setrlimit", &["resource", "rlim"]),
    (186, "gettid", &[]),
    (200, "tkill", &["pid", "sig"]),
    (201, "time", &["tloc"]),
    (202, "futex", &["uaddr", "op", "val", "utime", "uaddr2", "val3"]),
    (203, "sched_setaffinity", &["pid", "len", "user_mask_ptr"]),
    (204, "sched_getaffinity", &["pid", "len", "user_mask_ptr"]),
    (217, "getdents64", &["fd", "dirent", "count"]),
    (218, "set_tid_address", &["tidptr"]),
    (228, "clock_gettime", &["which_clock", "tp"]),
    (229, "clock_getres", &["which_clock", "tp"]),
    (230, "clock_nanosleep", &["which_clock", "flags", "rqtp", "rmtp"]),
    (231, "exit_group", &["error_code"]),
    (232, "epoll_wait", &["epfd", "events", "maxevents", "timeout"]),
    (233, "epoll_ctl", &["epfd", "op", "fd", "event"]),
    (234, "tgkill", &["tgid", "pid", "sig"]),
    (257, "openat", &["dfd", "filename", "flags", "mode"]),
    (258, "mkdirat", &["dfd", "pathname", "mode"]),
    (262, "newfstatat", &["dfd", "filename", "statbuf", "flag"]),
    (263, "unlinkat", &["dfd", "pathname", "flag"]),
    (266, "symlinkat", &["oldname", "newdfd", "newname"]),
    (267, "readlinkat", &["dfd", "pathname", "buf", "bufsiz"]),
    (268, "fchmodat", &["dfd", "filename", "mode"]),
    (269, "faccessat", &["dfd", "filename", "mode"]),
    (270, "pselect6", &["n", "inp", "outp", "exp", "tsp", "sig"]),
    (271, "ppoll", &["ufds", "nfds", "tsp", "sigmask", "sigsetsize"]),
    (273, "set_robust_list", &["head", "len"]),
    (274, "get_robust_list", &["pid", "head_ptr", "len_ptr"]),
    (281, "epoll_pwait", &["epfd", "events", "maxevents", "timeout", "sigmask", "sigsetsize"]),
    (284, "eventfd", &["count"]),
    (285, "fallocate", &["fd", "mode", "offset", "len"]),
    (288, "accept4", &["fd", "upeer_sockaddr", "upeer_addrlen", "flags"]),
    (290, "eventfd2", &["count", "flags"]),
    (291, "epoll_create1", &["flags"]),
    (292, "dup3", &["oldfd", "newfd", "flags"]),
    (293, "pipe2", &["fildes", "flags"]),
    (302, "prlimit64", &["pid", "resource", "new_rlim", "old_rlim"]),
    (318, "getrandom", &["buf", "count", "flags"]),
    (332, "statx", &["dfd", "filename", "flags", "mask", "buffer"]),
    (334, "rseq", &["rseq", "rseq_len", "flags", "sig"]),
    (435, "clone3", &["uargs", "size"]),
    (439, "faccessat2", &["dfd", "filename", "mode", "flags"]),
];

static INDEX: Lazy<HashMap<&'static str, HashMap<i64, SyscallDef>>> = Lazy::new(|| {
    let mut index = HashMap::new();
    let x86_64 = X86_64
        .iter()
        .map(|&(nr, name, args)| (nr, SyscallDef { name, args }))
        .collect();
    index.insert("x86_64", x86_64);
    index
});

/// Look up one syscall definition.
pub fn lookup(arch: &str, nr: i64) -> Option<&'static SyscallDef> {
    INDEX.get(arch)?.get(&nr)
}

/// Argument count the decoder knows for `(arch, nr)`, if any.
pub fn arity(arch: &str, nr: i64) -> Option<usize> {
    lookup(arch, nr).map(|def| def.args.len())
}

fn format_value(value: u64) -> String {
    let signed = value as i64;
    if value < 0x1000 {
        value.to_string()
    } else if signed < 0 && signed > -0x1000 {
        signed.to_string()
    } else {
        format!("{value:#x}")
    }
}

/// Render a syscall entry as `name(a1, a2, ...)`.
pub fn describe(arch: &str, nr: i64, args: &[u64]) -> String {
    let rendered: Vec<String> = args.iter().map(|&a| format_value(a)).collect();
    match lookup(arch, nr) {
        Some(def) => format!("{}({})", def.name, rendered.join(", ")),
        None => format!("syscall_{}({})", nr, rendered.join(", ")),
    }
}

/// Render a syscall return value.
pub fn describe_ret(ret: i64) -> String {
    if -0x1000 < ret && ret < 0x1000 {
        ret.to_string()
    } else {
        format!("{:#x}", ret as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_known_syscall() {
        let def = lookup("x86_64", 0).unwrap();
        assert_eq!(def.name, "read");
        assert_eq!(def.args, &["fd", "buf", "count"]);
        assert_eq!(arity("x86_64", 0), Some(3));
    }

    #[test]
    fn lookup_unknown_syscall() {
        assert!(lookup("x86_64", 9999).is_none());
        assert!(lookup("riscv64", 0).is_none());
        assert_eq!(arity("x86_64", 9999), None);
    }

    #[test]
    fn zero_arity_syscalls() {
        assert_eq!(arity("x86_64", 39), Some(0));
        assert_eq!(describe("x86_64", 39, &[]), "getpid()");
    }

    #[test]
    fn describe_formats_small_values_decimal() {
        assert_eq!(describe("x86_64", 0, &[3, 0, 32]), "read(3, 0, 32)");
    }

    #[test]
    fn describe_formats_large_values_hex() {
        assert_eq!(
            describe("x86_64", 1, &[1, 0x4000_0000_1000, 14]),
            "write(1, 0x400000001000, 14)"
        );
    }

    #[test]
    fn describe_formats_small_negatives_signed() {
        assert_eq!(describe("x86_64", 3, &[(-100i64) as u64]), "close(-100)");
    }

    #[test]
    fn describe_unknown_uses_placeholder() {
        assert_eq!(describe("x86_64", 9999, &[1, 2]), "syscall_9999(1, 2)");
    }

    #[test]
    fn describe_ret_formats() {
        assert_eq!(describe_ret(0), "0");
        assert_eq!(describe_ret(-2), "-2");
        assert_eq!(describe_ret(0x4000_0000_1000), "0x400000001000");
    }
}
