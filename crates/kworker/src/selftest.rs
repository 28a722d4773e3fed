//! Built-in smoke checks behind `--test` / `--full-test`.
//!
//! These run without a driver pipe and without a real toolchain, so a
//! freshly deployed worker can be sanity-checked on the build machine
//! itself. The quick set covers the pure state machines; the full set also
//! drives the interception shims against the live sandbox.

use crate::pe::image::{apply_reset, build_reset_plan};
use crate::pe::{ImageSectionHeader, SectionFlags};
use crate::protocol::{self, JobArg, JobRequest, Message};
use crate::temp_store::{CreateOutcome, TempStore};
use crate::win32::file;

type CheckResult = Result<(), String>;

fn check(name: &str, result: CheckResult, failures: &mut Vec<String>) {
    match result {
        Ok(()) => eprintln!("kWorker selftest: {name}: ok"),
        Err(why) => {
            eprintln!("kWorker selftest: {name}: FAILED: {why}");
            failures.push(name.to_owned());
        }
    }
}

/// Run the checks; returns true when everything passed.
pub fn run(full: bool) -> bool {
    let mut failures = Vec::new();
    check("temp-store", temp_store_round_trip(), &mut failures);
    check("environment", env_round_trip(), &mut failures);
    check("reset-plan", reset_plan_round_trip(), &mut failures);
    check("protocol", protocol_round_trip(), &mut failures);
    if full {
        check("sandbox-shims", sandbox_shim_round_trip(), &mut failures);
    }
    if failures.is_empty() {
        eprintln!("kWorker selftest: all checks passed");
        true
    } else {
        eprintln!("kWorker selftest: {} check(s) failed", failures.len());
        false
    }
}

fn temp_store_round_trip() -> CheckResult {
    let mut store = TempStore::new();
    let path = r"C:\T\_CL_5e1f7e57aa";
    let CreateOutcome::Opened(tf) = store.create(path, file::CREATE_ALWAYS) else {
        return Err("create refused".to_owned());
    };
    let data: Vec<u8> = (0..1 << 20).map(|i| (i & 0xFF) as u8).collect();
    let mut tf = tf.lock().unwrap();
    tf.write_at(0, &data).map_err(|e| format!("write: {e:#x}"))?;
    if tf.size() != 1 << 20 {
        return Err(format!("size {} after 1 MiB write", tf.size()));
    }
    let mut back = vec![0u8; data.len()];
    if tf.read_at(0, &mut back) != data.len() || back != data {
        return Err("read-back mismatch".to_owned());
    }
    if tf.read_at(1 << 20, &mut back) != 0 {
        return Err("read past EOF returned bytes".to_owned());
    }
    drop(tf);
    if store.delete(path) != Some(true) {
        return Err("delete on temp path failed".to_owned());
    }
    Ok(())
}

fn env_round_trip() -> CheckResult {
    let mut env = crate::environment::Environment::new();
    env.set("V", "S1");
    env.set("V", "S2");
    env.unset("V");
    env.set("V", "S1");
    if env.get("v") != Some("S1") {
        return Err("ANSI view diverged".to_owned());
    }
    let wide = env.get_wide("V").ok_or("wide view missing")?;
    if crate::win32::from_wide(wide) != "S1" {
        return Err("wide view diverged".to_owned());
    }
    Ok(())
}

fn reset_plan_round_trip() -> CheckResult {
    let section = ImageSectionHeader {
        name: *b".data\0\0\0",
        virtual_size: 0x800,
        virtual_address: 0x1000,
        size_of_raw_data: 0x800,
        pointer_to_raw_data: 0,
        pointer_to_relocations: 0,
        pointer_to_linenumbers: 0,
        number_of_relocations: 0,
        number_of_linenumbers: 0,
        characteristics: (SectionFlags::INITIALIZED_DATA
            | SectionFlags::READ
            | SectionFlags::WRITE)
            .bits(),
    };
    let mut virgin = vec![0u8; 0x1800];
    for b in &mut virgin[0x1000..0x1400] {
        *b = 0x42;
    }
    let plan = build_reset_plan(&[section], &virgin);
    let mut live = virgin.clone();
    for b in &mut live[0x1000..0x1800] {
        *b = 0x99;
    }
    apply_reset(&plan, &virgin, &mut live);
    if live != virgin {
        return Err("reset did not restore the virgin bytes".to_owned());
    }
    Ok(())
}

fn protocol_round_trip() -> CheckResult {
    let job = JobRequest {
        exe_path: r"C:\vc\bin\cl.exe".to_owned(),
        working_dir: r"C:\build".to_owned(),
        argv: vec![JobArg::plain("cl.exe"), JobArg::plain("/c")],
        env: vec!["PATH=C:\\vc\\bin".to_owned()],
        watcom_quoting: false,
        no_pch_caching: false,
        special_env_name: String::new(),
        post_cmd_argv: vec![],
    };
    let frame = protocol::encode_job(&job);
    let Message::Job(decoded) =
        protocol::read_message(&mut frame.as_slice()).map_err(|e| e.to_string())?;
    if *decoded != job {
        return Err("decoded job differs".to_owned());
    }
    Ok(())
}

/// Drive the intercepted surface against the live sandbox: a cached header
/// read, the hash fast path, and the between-jobs cleanup invariant.
fn sandbox_shim_round_trip() -> CheckResult {
    use crate::replace::api;
    use crate::sandbox::{job, sandbox};

    let dir = std::env::temp_dir().join(format!("kworker-selftest-{}", std::process::id()));
    std::fs::create_dir_all(&dir).map_err(|e| e.to_string())?;
    let header = dir.join("selftest.h");
    let content = vec![0x5Au8; 4096];
    std::fs::write(&header, &content).map_err(|e| e.to_string())?;
    let path_w = crate::win32::wide(&header.display().to_string().replace('/', "\\"));

    let sb = sandbox();
    // SAFETY: the shims are driven with valid pointers throughout.
    let result: Result<(), String> = unsafe {
        let h = api::kw_create_file_w(
            path_w.as_ptr(),
            file::GENERIC_READ,
            file::FILE_SHARE_READ,
            std::ptr::null_mut(),
            file::OPEN_EXISTING,
            0,
            0,
        );
        if h == usize::MAX {
            return Err("cached open failed".to_owned());
        }
        let mut buf = vec![0u8; 4096];
        let mut read = 0u32;
        if api::kw_read_file(h, buf.as_mut_ptr(), 4096, &mut read, std::ptr::null_mut()) == 0
            || read != 4096
        {
            return Err("cached read failed".to_owned());
        }
        let mut hash = 0usize;
        if api::kw_crypt_create_hash(0, crate::win32::alg::CALG_MD5, 0, 0, &mut hash) == 0 {
            return Err("CryptCreateHash failed".to_owned());
        }
        if api::kw_crypt_hash_data(hash, buf.as_ptr(), 4096, 0) == 0 {
            return Err("CryptHashData failed".to_owned());
        }
        let mut digest = [0u8; 16];
        let mut len = 16u32;
        if api::kw_crypt_get_hash_param(
            hash,
            crate::win32::alg::HP_HASHVAL,
            digest.as_mut_ptr(),
            &mut len,
            0,
        ) == 0
        {
            return Err("CryptGetHashParam failed".to_owned());
        }
        let expect = crate::hash_cache::HashAlg::Md5.compute(&content);
        api::kw_crypt_destroy_hash(hash);
        api::kw_close_handle(h);
        if digest.to_vec() != expect.to_vec() {
            return Err("digest mismatch".to_owned());
        }
        Ok(())
    };
    let _ = std::fs::remove_dir_all(&dir);
    result?;

    job::late_cleanup();
    if sb.handles.live_count() != 2 {
        return Err(format!(
            "handle table holds {} entries after cleanup",
            sb.handles.live_count()
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    #[test]
    fn quick_checks_pass() {
        let _guard = crate::sandbox::test_job_guard();
        assert!(super::run(false));
    }

    #[test]
    fn full_checks_pass() {
        let _guard = crate::sandbox::test_job_guard();
        assert!(super::run(true));
    }
}
