// NEOX CONFIGURATION SURFACE
// THE GOVERNOR PUBLISHES ITS TUNABLES WHILE AT LEAST ONE POLICY IS ACTIVE.
// INSTALLED ON THE FIRST ACTIVATION, REMOVED WHEN THE LAST ONE STOPS.
//
// DirSurface EXPOSES ONE FILE PER ATTRIBUTE UNDER A DIRECTORY. EDITS ARE
// PICKED UP BY sync(), WHICH THE DAEMON'S MONITOR LOOP CALLS EVERY SECOND.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use log::{debug, warn};

use crate::governor::Governor;

pub trait ConfigSurface: Send + Sync {
    fn install(&self, attrs: &[(&'static str, String)]) -> io::Result<()>;
    fn remove(&self);
}

// NO SURFACE: TUNABLES ONLY REACHABLE THROUGH THE API
pub struct NullSurface;

impl ConfigSurface for NullSurface {
    fn install(&self, _attrs: &[(&'static str, String)]) -> io::Result<()> {
        Ok(())
    }

    fn remove(&self) {}
}

pub struct DirSurface {
    dir: PathBuf,
    // None WHILE NOT INSTALLED. OTHERWISE THE LAST TEXT WRITTEN PER FILE.
    written: Mutex<Option<HashMap<&'static str, String>>>,
}

impl DirSurface {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into(), written: Mutex::new(None) }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn is_installed(&self) -> bool {
        self.written.lock().unwrap_or_else(PoisonError::into_inner).is_some()
    }

    // APPLY EVERY FILE EDITED SINCE THE LAST SYNC THROUGH THE GOVERNOR'S
    // store(). REJECTED EDITS AND WRITES TO READ-ONLY FILES ARE REVERTED.
    // EVERY FILE IS THEN REFRESHED, SO CLAMPED VALUES BECOME VISIBLE.
    // RETURNS THE NUMBER OF EDITS ACCEPTED.
    pub fn sync(&self, gov: &Governor) -> usize {
        let mut guard = self.written.lock().unwrap_or_else(PoisonError::into_inner);
        let written = match guard.as_mut() {
            Some(w) => w,
            None => return 0,
        };

        let mut applied = 0;
        for (name, last) in written.iter() {
            let path = self.dir.join(name);
            let text = match fs::read_to_string(&path) {
                Ok(t) => t,
                Err(e) => {
                    warn!("surface: read {}: {}", path.display(), e);
                    continue;
                }
            };
            if text.trim() == last.trim() {
                continue;
            }
            match gov.store(name, &text) {
                Ok(()) => applied += 1,
                Err(e) => warn!("surface: {}", e),
            }
        }

        for (name, value) in gov.attribute_values() {
            if written.get(name) == Some(&value) {
                continue;
            }
            if let Err(e) = fs::write(self.dir.join(name), &value) {
                warn!("surface: write {}: {}", name, e);
            }
            debug!("surface: {} = {}", name, value.trim());
            written.insert(name, value);
        }
        // FILES THAT FAILED TO PARSE STILL HOLD THE BAD TEXT: FORCE A REWRITE
        for (name, value) in written.iter() {
            let path = self.dir.join(name);
            if fs::read_to_string(&path).map(|t| t != *value).unwrap_or(true) {
                let _ = fs::write(&path, value);
            }
        }
        applied
    }
}

impl ConfigSurface for DirSurface {
    fn install(&self, attrs: &[(&'static str, String)]) -> io::Result<()> {
        fs::create_dir_all(&self.dir)?;
        let mut written = HashMap::with_capacity(attrs.len());
        for (name, value) in attrs {
            fs::write(self.dir.join(name), value)?;
            written.insert(*name, value.clone());
        }
        *self.written.lock().unwrap_or_else(PoisonError::into_inner) = Some(written);
        Ok(())
    }

    fn remove(&self) {
        let prev = self.written.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(written) = prev {
            for name in written.keys() {
                let _ = fs::remove_file(self.dir.join(name));
            }
            // ONLY SUCCEEDS IF NOTHING ELSE LIVES THERE
            let _ = fs::remove_dir(&self.dir);
        }
    }
}
