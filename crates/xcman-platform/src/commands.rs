#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Prepares a child process to run unattended: no console window on
/// Windows, no inherited stdin, and killed if its handle is dropped.
pub trait HideWindow {
    fn hide_window(&mut self) -> &mut Self;
}

impl HideWindow for tokio::process::Command {
    fn hide_window(&mut self) -> &mut Self {
        #[cfg(windows)]
        self.creation_flags(CREATE_NO_WINDOW);

        self.stdin(std::process::Stdio::null()).kill_on_drop(true)
    }
}
