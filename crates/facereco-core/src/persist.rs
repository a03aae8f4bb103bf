//! Binary database format.
//!
//! ```text
//! [4B magic "FRDB"] [4B version]
//! [4B total_tracks] [4B total_descriptors] [8B size_bytes] [4B person_count]
//! For each person:
//!   [4B track_count] [8B size_bytes] [4B descriptor_count]
//!   [4B name_len] [name_len bytes UTF-8 name]
//!   face image: [4B rows] [4B cols] [4B pixel_format] [8B row_stride]
//!               [4B data_len] [data_len bytes]
//!   For each track:
//!     [8B size_bytes] [4B descriptor_count]
//!     For each descriptor:
//!       [4B rows] [4B cols] [4B element_format] [8B row_stride]
//!       [rows * row_stride bytes of f32]
//! ```
//!
//! All multi-byte values are little-endian. Stored counts and sizes are
//! checked against the data that follows them; any disagreement rejects the
//! whole file.

use crate::store::{Catalog, Person, Track};
use crate::types::Descriptor;
use image::RgbImage;
use std::io::{Read, Write};
use thiserror::Error;

const MAGIC: [u8; 4] = *b"FRDB";
const VERSION: u32 = 1;

const PIXEL_FORMAT_NONE: u32 = 0;
const PIXEL_FORMAT_RGB8: u32 = 1;
const ELEMENT_FORMAT_F32: u32 = 1;

// Upper bounds on length fields, checked before allocating.
const MAX_NAME_LEN: usize = 4096;
const MAX_IMAGE_BYTES: usize = 64 << 20;
const MAX_DESCRIPTOR_VALUES: usize = 1 << 20;

#[derive(Error, Debug)]
pub enum PersistError {
    #[error("database I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("not a face database (magic {0:?})")]
    BadMagic([u8; 4]),
    #[error("unsupported database version {found} (want {})", VERSION)]
    UnsupportedVersion { found: u32 },
    #[error("corrupt database: {0}")]
    Corrupt(String),
}

fn corrupt(msg: impl Into<String>) -> PersistError {
    PersistError::Corrupt(msg.into())
}

pub fn write_catalog(catalog: &Catalog, w: &mut impl Write) -> Result<(), PersistError> {
    w.write_all(&MAGIC)?;
    w.write_all(&VERSION.to_le_bytes())?;

    write_u32(w, catalog.total_tracks())?;
    write_u32(w, catalog.total_descriptors())?;
    w.write_all(&catalog.size_bytes().to_le_bytes())?;
    write_u32(w, catalog.persons().len())?;

    for person in catalog.persons() {
        write_u32(w, person.track_count())?;
        w.write_all(&person.size_bytes().to_le_bytes())?;
        write_u32(w, person.descriptor_count())?;

        let name = person.name().as_bytes();
        write_u32(w, name.len())?;
        w.write_all(name)?;

        write_face_image(w, person.face_image())?;

        for track in person.tracks() {
            w.write_all(&track.size_bytes().to_le_bytes())?;
            write_u32(w, track.len())?;
            for descriptor in track.descriptors() {
                write_descriptor(w, descriptor)?;
            }
        }
    }

    Ok(())
}

pub fn read_catalog(r: &mut impl Read) -> Result<Catalog, PersistError> {
    let mut magic = [0u8; 4];
    r.read_exact(&mut magic)?;
    if magic != MAGIC {
        return Err(PersistError::BadMagic(magic));
    }
    let version = read_u32(r)?;
    if version != VERSION {
        return Err(PersistError::UnsupportedVersion { found: version });
    }

    let total_tracks = read_u32(r)? as usize;
    let total_descriptors = read_u32(r)? as usize;
    let total_size = read_u64(r)?;
    let person_count = read_u32(r)? as usize;

    let mut persons = Vec::new();
    let (mut tracks_seen, mut descriptors_seen, mut size_seen) = (0usize, 0usize, 0u64);

    for p in 0..person_count {
        let track_count = read_u32(r)? as usize;
        let person_size = read_u64(r)?;
        let person_descriptors = read_u32(r)? as usize;

        let name_len = read_u32(r)? as usize;
        if name_len > MAX_NAME_LEN {
            return Err(corrupt(format!("person {p}: name length {name_len}")));
        }
        let name = String::from_utf8(read_bytes(r, name_len)?)
            .map_err(|e| corrupt(format!("person {p}: {e}")))?;

        let face_image = read_face_image(r)?;

        let mut tracks = Vec::new();
        let (mut person_descriptors_seen, mut person_size_seen) = (0usize, 0u64);
        for t in 0..track_count {
            let track_size = read_u64(r)?;
            let descriptor_count = read_u32(r)? as usize;
            if descriptor_count == 0 {
                return Err(corrupt(format!("person {p} track {t} is empty")));
            }

            let mut descriptors = Vec::new();
            for _ in 0..descriptor_count {
                descriptors.push(read_descriptor(r)?);
            }
            let actual_size: u64 = descriptors.iter().map(Descriptor::size_bytes).sum();
            if actual_size != track_size {
                return Err(corrupt(format!(
                    "person {p} track {t}: size {track_size} != {actual_size}"
                )));
            }

            person_descriptors_seen += descriptor_count;
            person_size_seen += track_size;
            tracks.push(Track::from_parts(descriptors, track_size));
        }

        if track_count == 0 {
            return Err(corrupt(format!("person {p} has no tracks")));
        }
        if person_descriptors_seen != person_descriptors || person_size_seen != person_size {
            return Err(corrupt(format!("person {p}: cached totals disagree with tracks")));
        }

        tracks_seen += track_count;
        descriptors_seen += person_descriptors;
        size_seen += person_size;
        persons.push(Person::from_parts(
            name,
            face_image,
            tracks,
            person_descriptors,
            person_size,
        ));
    }

    if tracks_seen != total_tracks || descriptors_seen != total_descriptors || size_seen != total_size {
        return Err(corrupt("database totals disagree with persons"));
    }

    Ok(Catalog::from_parts(persons, total_tracks, total_descriptors, total_size))
}

fn write_face_image(w: &mut impl Write, image: Option<&RgbImage>) -> Result<(), PersistError> {
    match image {
        None => {
            write_u32(w, 0)?;
            write_u32(w, 0)?;
            w.write_all(&PIXEL_FORMAT_NONE.to_le_bytes())?;
            w.write_all(&0u64.to_le_bytes())?;
            write_u32(w, 0)?;
        }
        Some(img) => {
            let data = img.as_raw();
            write_u32(w, img.height() as usize)?;
            write_u32(w, img.width() as usize)?;
            w.write_all(&PIXEL_FORMAT_RGB8.to_le_bytes())?;
            w.write_all(&(img.width() as u64 * 3).to_le_bytes())?;
            write_u32(w, data.len())?;
            w.write_all(data)?;
        }
    }
    Ok(())
}

fn read_face_image(r: &mut impl Read) -> Result<Option<RgbImage>, PersistError> {
    let rows = read_u32(r)?;
    let cols = read_u32(r)?;
    let format = read_u32(r)?;
    let stride = read_u64(r)?;
    let len = read_u32(r)? as usize;
    if len > MAX_IMAGE_BYTES {
        return Err(corrupt(format!("face image of {len} bytes")));
    }
    let data = read_bytes(r, len)?;

    match format {
        PIXEL_FORMAT_NONE if len == 0 => Ok(None),
        PIXEL_FORMAT_RGB8 => {
            if stride != cols as u64 * 3 {
                return Err(corrupt(format!("face image stride {stride} for width {cols}")));
            }
            RgbImage::from_raw(cols, rows, data)
                .map(Some)
                .ok_or_else(|| corrupt(format!("face image {cols}x{rows} with {len} bytes")))
        }
        other => Err(corrupt(format!("unknown pixel format {other}"))),
    }
}

fn write_descriptor(w: &mut impl Write, descriptor: &Descriptor) -> Result<(), PersistError> {
    let values = descriptor.values();
    write_u32(w, 1)?;
    write_u32(w, values.len())?;
    w.write_all(&ELEMENT_FORMAT_F32.to_le_bytes())?;
    w.write_all(&descriptor.size_bytes().to_le_bytes())?;
    for v in values {
        w.write_all(&v.to_le_bytes())?;
    }
    Ok(())
}

fn read_descriptor(r: &mut impl Read) -> Result<Descriptor, PersistError> {
    let rows = read_u32(r)? as usize;
    let cols = read_u32(r)? as usize;
    let format = read_u32(r)?;
    let stride = read_u64(r)?;

    if format != ELEMENT_FORMAT_F32 {
        return Err(corrupt(format!("unknown descriptor element format {format}")));
    }
    let count = rows
        .checked_mul(cols)
        .filter(|&n| n <= MAX_DESCRIPTOR_VALUES)
        .ok_or_else(|| corrupt(format!("descriptor of {rows}x{cols}")))?;
    if stride != (cols * 4) as u64 {
        return Err(corrupt(format!("descriptor stride {stride} for {cols} columns")));
    }

    let mut values = Vec::with_capacity(count);
    let mut buf = [0u8; 4];
    for _ in 0..count {
        r.read_exact(&mut buf)?;
        values.push(f32::from_le_bytes(buf));
    }
    Ok(Descriptor::from_values(values))
}

fn write_u32(w: &mut impl Write, n: usize) -> Result<(), PersistError> {
    let n = u32::try_from(n).map_err(|_| corrupt(format!("count {n} does not fit in 32 bits")))?;
    w.write_all(&n.to_le_bytes())?;
    Ok(())
}

fn read_u32(r: &mut impl Read) -> Result<u32, PersistError> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64(r: &mut impl Read) -> Result<u64, PersistError> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

fn read_bytes(r: &mut impl Read, len: usize) -> Result<Vec<u8>, PersistError> {
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)?;
    Ok(buf)
}
