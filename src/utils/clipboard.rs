use std::io::Write;
use std::process::{Command, Stdio};

/// Copy text to the system clipboard. Cross-platform.
pub fn copy_to_clipboard(text: &str) -> bool {
    #[cfg(windows)]
    let mut command = {
        use std::os::windows::process::CommandExt;
        const CREATE_NO_WINDOW: u32 = 0x08000000;
        let mut cmd = Command::new("clip");
        cmd.creation_flags(CREATE_NO_WINDOW);
        cmd
    };

    #[cfg(target_os = "macos")]
    let mut command = Command::new("pbcopy");

    #[cfg(all(not(windows), not(target_os = "macos")))]
    let mut command = {
        let mut cmd = Command::new("xclip");
        cmd.args(["-selection", "clipboard"]);
        cmd
    };

    let result = command
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .and_then(|mut child| {
            if let Some(mut stdin) = child.stdin.take() {
                stdin.write_all(text.as_bytes())?;
            }
            child.wait()
        });

    matches!(result, Ok(status) if status.success())
}
