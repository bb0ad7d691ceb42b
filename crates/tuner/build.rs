use std::process::Command;

fn git(args: &[&str]) -> Option<String> {
    let out = Command::new("git").args(args).output().ok()?;
    if !out.status.success() {
        return None;
    }
    let text = String::from_utf8(out.stdout).ok()?;
    Some(text.trim().to_string())
}

fn main() {
    // Packaged builds have no .git; let them pass the revision in
    println!("cargo:rerun-if-env-changed=DCA_TUNER_BUILD_REV");
    let revision = std::env::var("DCA_TUNER_BUILD_REV")
        .ok()
        .filter(|s| !s.is_empty())
        .or_else(|| {
            let hash = git(&["rev-parse", "--short", "HEAD"]).filter(|s| !s.is_empty())?;
            let dirty = git(&["status", "--porcelain", "--untracked-files=no"])
                .map_or(false, |s| !s.is_empty());
            Some(if dirty { format!("{hash}-dirty") } else { hash })
        })
        .unwrap_or_else(|| "unknown".to_string());

    println!("cargo:rustc-env=GIT_HASH={revision}");

    if let Some(head) = git(&["rev-parse", "--git-path", "HEAD"]) {
        println!("cargo:rerun-if-changed={head}");
    }
    if let Some(refs) = git(&["rev-parse", "--git-path", "refs/heads"]) {
        println!("cargo:rerun-if-changed={refs}");
    }
}
