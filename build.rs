use std::process::Command;

fn main() {
    // An explicit GIT_COMMIT from the environment wins over git.
    if std::env::var("GIT_COMMIT").is_err() {
        let commit = Command::new("git")
            .args(["rev-parse", "--short", "HEAD"])
            .output()
            .ok()
            .filter(|output| output.status.success())
            .and_then(|output| String::from_utf8(output.stdout).ok())
            .map(|commit| commit.trim().to_string())
            .filter(|commit| !commit.is_empty());

        if let Some(commit) = commit {
            println!("cargo:rustc-env=GIT_COMMIT={commit}");
        }
    }

    println!("cargo:rerun-if-env-changed=GIT_COMMIT");
    println!("cargo:rerun-if-changed=.git/HEAD");
    println!("cargo:rerun-if-changed=build.rs");
}
