//! Owner-only permission restriction, POSIX and Windows.

use std::path::Path;

use crate::errors::{Result, SetupError};

/// Restrict `path` to owner-only access.
///
/// POSIX: chmod 0o600. Windows: replaces the file's DACL with a single
/// allow-entry for the current user and disables inheritance from the
/// parent directory.
///
/// With `strict` false, failures are logged and swallowed. With `strict`
/// true, failures propagate as [`SetupError::Permission`].
pub fn restrict_permissions(path: &Path, strict: bool) -> Result<()> {
    match imp::restrict(path) {
        Ok(()) => Ok(()),
        Err(source) if strict => Err(SetupError::Permission {
            path: path.display().to_string(),
            source,
        }),
        Err(source) => {
            tracing::debug!(
                path = %path.display(),
                error = %source,
                "failed to restrict permissions"
            );
            Ok(())
        }
    }
}

#[cfg(unix)]
mod imp {
    use std::fs;
    use std::io;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;

    pub(super) fn restrict(path: &Path) -> io::Result<()> {
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))
    }
}

#[cfg(windows)]
mod imp {
    use std::io;
    use std::iter;
    use std::os::windows::ffi::OsStrExt;
    use std::path::Path;
    use std::ptr;

    use windows_sys::Win32::Foundation::GENERIC_ALL;
    use windows_sys::Win32::Security::Authorization::{SetNamedSecurityInfoW, SE_FILE_OBJECT};
    use windows_sys::Win32::Security::{
        AddAccessAllowedAce, GetLengthSid, InitializeAcl, LookupAccountNameW, ACL,
        DACL_SECURITY_INFORMATION, PROTECTED_DACL_SECURITY_INFORMATION, SID_NAME_USE,
    };
    use windows_sys::Win32::System::WindowsProgramming::GetUserNameW;

    const ACL_REVISION: u32 = 2;

    pub(super) fn restrict(path: &Path) -> io::Result<()> {
        let user = current_user()?;
        set_owner_only_acl(path, &user)
    }

    /// Resolve the current user through the identity API. `USERNAME` and
    /// friends are attacker-influenceable environment state and are never
    /// consulted.
    fn current_user() -> io::Result<Vec<u16>> {
        let mut buf = [0u16; 257];
        let mut size = buf.len() as u32;
        // SAFETY: buf is writable for `size` UTF-16 units.
        let ok = unsafe { GetUserNameW(buf.as_mut_ptr(), &mut size) };
        if ok == 0 {
            return Err(io::Error::last_os_error());
        }
        // size counts the terminating NUL, which LookupAccountNameW needs.
        Ok(buf[..size as usize].to_vec())
    }

    /// Replace the DACL with one GENERIC_ALL entry for `user`, inheritance
    /// disabled.
    fn set_owner_only_acl(path: &Path, user: &[u16]) -> io::Result<()> {
        let path_w: Vec<u16> = path
            .as_os_str()
            .encode_wide()
            .chain(iter::once(0))
            .collect();

        let mut sid = [0u8; 256];
        let mut sid_size = sid.len() as u32;
        let mut domain = [0u16; 256];
        let mut domain_size = domain.len() as u32;
        let mut sid_type: SID_NAME_USE = 0;

        // SAFETY: all out-pointers reference live stack buffers sized above.
        let ok = unsafe {
            LookupAccountNameW(
                ptr::null(),
                user.as_ptr(),
                sid.as_mut_ptr().cast(),
                &mut sid_size,
                domain.as_mut_ptr(),
                &mut domain_size,
                &mut sid_type,
            )
        };
        if ok == 0 {
            return Err(io::Error::last_os_error());
        }

        // SAFETY: sid was initialized by LookupAccountNameW above.
        let sid_len = unsafe { GetLengthSid(sid.as_mut_ptr().cast()) };
        // ACE header (4) + access mask (4) + SID, preceded by the 8-byte ACL
        // header.
        let ace_size = 4 + 4 + sid_len;
        let acl_size = 8 + ace_size;
        let mut acl_buf = vec![0u8; acl_size as usize];

        // SAFETY: acl_buf is acl_size bytes, zeroed and exclusively owned.
        let ok = unsafe {
            InitializeAcl(acl_buf.as_mut_ptr().cast::<ACL>(), acl_size, ACL_REVISION)
        };
        if ok == 0 {
            return Err(io::Error::last_os_error());
        }

        // SAFETY: acl_buf holds an initialized ACL with room for one ACE.
        let ok = unsafe {
            AddAccessAllowedAce(
                acl_buf.as_mut_ptr().cast::<ACL>(),
                ACL_REVISION,
                GENERIC_ALL,
                sid.as_mut_ptr().cast(),
            )
        };
        if ok == 0 {
            return Err(io::Error::last_os_error());
        }

        // SAFETY: path_w is NUL-terminated; acl_buf outlives the call.
        let status = unsafe {
            SetNamedSecurityInfoW(
                path_w.as_ptr(),
                SE_FILE_OBJECT,
                DACL_SECURITY_INFORMATION | PROTECTED_DACL_SECURITY_INFORMATION,
                ptr::null_mut(),
                ptr::null_mut(),
                acl_buf.as_ptr().cast::<ACL>(),
                ptr::null(),
            )
        };
        if status != 0 {
            return Err(io::Error::from_raw_os_error(status as i32));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[test]
    fn restrict_sets_owner_only_mode() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("secret.json");
        std::fs::write(&path, "{}").unwrap();

        restrict_permissions(&path, true).unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[cfg(windows)]
    #[test]
    fn restrict_succeeds_on_an_owned_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("secret.json");
        std::fs::write(&path, "{}").unwrap();

        restrict_permissions(&path, true).unwrap();
    }

    #[test]
    fn missing_file_is_swallowed_when_not_strict() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("absent.json");

        restrict_permissions(&path, false).unwrap();
    }

    #[test]
    fn missing_file_propagates_when_strict() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("absent.json");

        let err = restrict_permissions(&path, true).unwrap_err();
        match err {
            SetupError::Permission { path: p, .. } => assert!(p.contains("absent.json")),
            other => panic!("expected Permission, got {other:?}"),
        }
    }
}
