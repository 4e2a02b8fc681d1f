//! Minimal NPY (v1.0) reader/writer for little-endian float arrays.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use ndarray::{ArrayBase, ArrayD, Data, Dimension, IxDyn, ShapeBuilder};

const MAGIC: &[u8] = b"\x93NUMPY";
/// Header (magic + version + length + dict) is padded to this many bytes.
const HEADER_ALIGN: usize = 64;

pub trait NpyElement: Copy {
    fn descr() -> &'static str;
    fn write_le<W: Write>(self, writer: &mut W) -> std::io::Result<()>;
    fn from_le(bytes: &[u8]) -> Self;
    fn size() -> usize;
}

impl NpyElement for f32 {
    fn descr() -> &'static str {
        "<f4"
    }
    fn write_le<W: Write>(self, writer: &mut W) -> std::io::Result<()> {
        writer.write_all(&self.to_le_bytes())
    }
    fn from_le(bytes: &[u8]) -> Self {
        f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
    }
    fn size() -> usize {
        4
    }
}

impl NpyElement for f64 {
    fn descr() -> &'static str {
        "<f8"
    }
    fn write_le<W: Write>(self, writer: &mut W) -> std::io::Result<()> {
        writer.write_all(&self.to_le_bytes())
    }
    fn from_le(bytes: &[u8]) -> Self {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&bytes[..8]);
        f64::from_le_bytes(buf)
    }
    fn size() -> usize {
        8
    }
}

fn header_bytes<T: NpyElement>(shape: &[usize]) -> Vec<u8> {
    let dims: Vec<String> = shape.iter().map(|d| d.to_string()).collect();
    let shape_str = if dims.len() == 1 {
        format!("({},)", dims[0])
    } else {
        format!("({})", dims.join(", "))
    };
    let dict = format!(
        "{{'descr': '{}', 'fortran_order': False, 'shape': {}, }}",
        T::descr(),
        shape_str
    );

    // magic(6) + version(2) + length(2) + dict + '\n'
    let unpadded = MAGIC.len() + 2 + 2 + dict.len() + 1;
    let pad = (HEADER_ALIGN - unpadded % HEADER_ALIGN) % HEADER_ALIGN;
    let mut header = dict.into_bytes();
    header.extend(std::iter::repeat(b' ').take(pad));
    header.push(b'\n');
    header
}

/// Writes `array` in C order.
pub fn write_to<T, S, D, W>(writer: &mut W, array: &ArrayBase<S, D>) -> Result<()>
where
    T: NpyElement,
    S: Data<Elem = T>,
    D: Dimension,
    W: Write,
{
    let header = header_bytes::<T>(array.shape());
    let header_len = u16::try_from(header.len())
        .map_err(|_| anyhow!("NPY header too long for shape {:?}", array.shape()))?;
    writer.write_all(MAGIC)?;
    writer.write_all(&[1, 0])?;
    writer.write_all(&header_len.to_le_bytes())?;
    writer.write_all(&header)?;
    // Logical iteration order is row-major regardless of memory layout.
    for &value in array.iter() {
        value.write_le(writer)?;
    }
    Ok(())
}

pub fn write_npy<T, S, D>(path: &Path, array: &ArrayBase<S, D>) -> Result<()>
where
    T: NpyElement,
    S: Data<Elem = T>,
    D: Dimension,
{
    let file = File::create(path)
        .with_context(|| format!("Failed to create output file {}", path.display()))?;
    let mut writer = BufWriter::with_capacity(1024 * 1024, file);
    write_to(&mut writer, array)?;
    writer.flush()?;
    Ok(())
}

struct Header {
    descr: String,
    fortran_order: bool,
    shape: Vec<usize>,
}

fn dict_value<'a>(dict: &'a str, key: &str) -> Result<&'a str> {
    let needle = format!("'{}':", key);
    let start = dict
        .find(&needle)
        .ok_or_else(|| anyhow!("NPY header has no '{}' entry", key))?
        + needle.len();
    Ok(dict[start..].trim_start())
}

fn parse_header(dict: &str) -> Result<Header> {
    let descr_raw = dict_value(dict, "descr")?;
    let descr = descr_raw
        .strip_prefix('\'')
        .and_then(|rest| rest.split('\'').next())
        .ok_or_else(|| anyhow!("Malformed descr in NPY header: {}", dict))?
        .to_string();

    let fortran_order = dict_value(dict, "fortran_order")?.starts_with("True");

    let shape_raw = dict_value(dict, "shape")?;
    let close = shape_raw
        .find(')')
        .ok_or_else(|| anyhow!("Malformed shape in NPY header: {}", dict))?;
    let shape = shape_raw[..close]
        .trim_start_matches('(')
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<usize>())
        .collect::<std::result::Result<Vec<_>, _>>()
        .with_context(|| format!("Malformed shape in NPY header: {}", dict))?;

    Ok(Header {
        descr,
        fortran_order,
        shape,
    })
}

pub fn read_from<T: NpyElement, R: Read>(reader: &mut R) -> Result<ArrayD<T>> {
    let mut preamble = [0u8; 8];
    reader.read_exact(&mut preamble)?;
    if &preamble[..6] != MAGIC {
        return Err(anyhow!("Not an NPY file (bad magic)"));
    }
    let header_len = match preamble[6] {
        1 => {
            let mut len = [0u8; 2];
            reader.read_exact(&mut len)?;
            u16::from_le_bytes(len) as usize
        }
        2 | 3 => {
            let mut len = [0u8; 4];
            reader.read_exact(&mut len)?;
            u32::from_le_bytes(len) as usize
        }
        v => return Err(anyhow!("Unsupported NPY version {}", v)),
    };
    let mut dict = vec![0u8; header_len];
    reader.read_exact(&mut dict)?;
    let dict = String::from_utf8(dict).context("NPY header is not valid UTF-8")?;
    let header = parse_header(&dict)?;
    if header.descr != T::descr() {
        return Err(anyhow!(
            "NPY dtype mismatch: file has '{}', expected '{}'",
            header.descr,
            T::descr()
        ));
    }

    let count: usize = header.shape.iter().product();
    let mut raw = vec![0u8; count * T::size()];
    reader.read_exact(&mut raw)?;
    let values: Vec<T> = raw.chunks_exact(T::size()).map(T::from_le).collect();

    let shape = IxDyn(&header.shape);
    let array = if header.fortran_order {
        ArrayD::from_shape_vec(shape.f(), values)?
    } else {
        ArrayD::from_shape_vec(shape, values)?
    };
    Ok(array)
}

pub fn read_npy<T: NpyElement>(path: &Path) -> Result<ArrayD<T>> {
    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    read_from(&mut BufReader::new(file))
}
