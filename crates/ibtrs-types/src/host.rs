/// Maximum hostname length carried in a session info message.
pub const MAX_HOSTNAME_LEN: usize = 64;

/// Name of the local host, truncated to [`MAX_HOSTNAME_LEN`] bytes.
///
/// Falls back to `"localhost"` when the kernel refuses to report one.
pub fn local_hostname() -> String {
    let mut buf = [0u8; 256];
    // SAFETY: buf is valid for buf.len() bytes and gethostname writes at most that many.
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
    if rc != 0 {
        return "localhost".to_string();
    }
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    let name = String::from_utf8_lossy(&buf[..end]).into_owned();
    truncate_hostname(&name)
}

/// Truncate to at most [`MAX_HOSTNAME_LEN`] bytes on a char boundary.
pub fn truncate_hostname(name: &str) -> String {
    if name.len() <= MAX_HOSTNAME_LEN {
        return name.to_string();
    }
    let mut end = MAX_HOSTNAME_LEN;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    name[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_hostname_fits() {
        let name = local_hostname();
        assert!(!name.is_empty());
        assert!(name.len() <= MAX_HOSTNAME_LEN);
    }

    #[test]
    fn test_truncate_hostname() {
        let long = "h".repeat(100);
        assert_eq!(truncate_hostname(&long).len(), MAX_HOSTNAME_LEN);
        assert_eq!(truncate_hostname("node-1"), "node-1");
    }
}
