use anyhow::Result;
use std::path::Path;

#[derive(Debug, Clone)]
pub struct Segment {
    pub name: String,
    pub base: u32,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct Image {
    pub segments: Vec<Segment>,
}

impl Image {
    /// First byte past the highest segment.
    pub fn top(&self) -> u32 {
        self.segments
            .iter()
            .map(|s| s.base.wrapping_add(s.bytes.len() as u32))
            .max()
            .unwrap_or(0)
    }

    pub fn is_mapped(&self, addr: u32) -> bool {
        self.segments.iter().any(|s| {
            let end = s.base.wrapping_add(s.bytes.len() as u32);
            addr >= s.base && addr < end
        })
    }

    pub fn read_u8(&self, addr: u32) -> Option<u8> {
        self.segments.iter().find_map(|s| {
            let off = addr.checked_sub(s.base)? as usize;
            s.bytes.get(off).copied()
        })
    }
}

pub fn load_raw_bin(path: &Path, base: u32, skip: usize, len: Option<usize>) -> Result<Image> {
    let file = std::fs::read(path)?;
    anyhow::ensure!(skip <= file.len(), "--skip exceeds file size");
    let mut payload = &file[skip..];
    if let Some(lim) = len {
        anyhow::ensure!(lim <= payload.len(), "--len exceeds remaining file size after skip");
        payload = &payload[..lim];
    }
    anyhow::ensure!(
        (base as u64) + (payload.len() as u64) <= 0x11_0000,
        "image must fit below the real-mode addressing limit"
    );
    let seg = Segment {
        name: "segment0".into(),
        base,
        bytes: payload.to_vec(),
    };
    Ok(Image {
        segments: vec![seg],
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn loader_maps_skip_and_len() {
        let path = std::env::temp_dir().join("i386_blocks_loader.bin");
        std::fs::write(&path, [0u8, 1, 2, 3, 4, 5]).unwrap();
        let img = load_raw_bin(&path, 0x7C00, 2, Some(3)).unwrap();
        assert_eq!(img.segments.len(), 1);
        assert_eq!(img.segments[0].bytes, vec![2, 3, 4]);
        assert_eq!(img.read_u8(0x7C00), Some(2));
        assert_eq!(img.read_u8(0x7C03), None);
        assert_eq!(img.top(), 0x7C03);
        assert!(load_raw_bin(&path, 0, 7, None).is_err());
        let _ = std::fs::remove_file(&path);
    }
}
