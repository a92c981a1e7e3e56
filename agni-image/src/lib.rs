//! Reads and writes the Agni executable binary format described in
//! §6: a fixed main header followed by an instruction stream, a
//! string stream, a function table, and a host-function table, all
//! little-endian on disk regardless of host byte order (§9).

pub mod checksum;

use byteorder::{ReadBytesExt, WriteBytesExt};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use util::Endian;

/// Executable signature: two `0x90` padding bytes, `AGNI`, two more
/// `0x90` padding bytes.
pub const SIGNATURE: [u8; 8] = [0x90, 0x90, b'A', b'G', b'N', b'I', 0x90, 0x90];

/// Sentinel meaning "no host declared" / "no main function" / "use
/// the default stack size," depending on field.
pub const NONE_INDEX: u32 = u32::MAX;

/// Default stack size substituted by the loader when a header's
/// `stack_size` field is [`NONE_INDEX`].
pub const DEFAULT_STACK_SIZE: u32 = 1024;

#[derive(Debug, thiserror::Error)]
pub enum ImageError {
    #[error("not an Agni executable: bad signature")]
    BadSignature,
    #[error("host function name table entry exceeds 255 bytes")]
    NameTooLong,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// The fixed-layout header at the start of every executable (§6).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct MainHeader {
    pub available_agni_version: (u8, u8),
    pub required_agni_version: (u8, u8),
    /// Index into the string table, or [`NONE_INDEX`] if no host name
    /// was declared.
    pub host_string_index: u32,
    pub host_version: (u8, u8),
    pub checksum: u32,
    /// [`NONE_INDEX`] means "use the loader's default" (§4.4).
    pub stack_size: u32,
    pub global_data_size: u32,
    /// [`NONE_INDEX`] means the executable has no entry point.
    pub main_index: u32,
    pub thread_priority_type: u8,
    pub thread_priority_user_ms: u32,
}

/// One decoded operand: a type tag plus its payload, matching the
/// widths of §6 (`i32` for int/indices, `f32` for float, `{i32,i32}`
/// for a relative stack index, `u8` for a register).
#[derive(Clone, Copy, PartialEq, Debug)]
pub enum Operand {
    Null,
    Integer(i32),
    Float(f32),
    IndexString(i32),
    IndexStackAbsolute(i32),
    IndexStackRelative(i32, i32),
    IndexInstruction(i32),
    IndexFunction(i32),
    IndexFunctionHost(i32),
    Register(u8),
    StackBaseMarker,
}

impl Operand {
    fn type_tag(&self) -> u8 {
        match self {
            Operand::Null => 0,
            Operand::Integer(_) => 1,
            Operand::Float(_) => 2,
            Operand::IndexString(_) => 3,
            Operand::IndexStackAbsolute(_) => 5,
            Operand::IndexStackRelative(_, _) => 6,
            Operand::IndexInstruction(_) => 7,
            Operand::IndexFunction(_) => 8,
            Operand::IndexFunctionHost(_) => 9,
            Operand::Register(_) => 10,
            Operand::StackBaseMarker => 11,
        }
    }
}

#[derive(Clone, Debug)]
pub struct InstructionRecord {
    pub opcode: u16,
    pub operands: Vec<Operand>,
}

#[derive(Clone, Debug)]
pub struct FunctionEntry {
    pub entry_point: u32,
    pub parameter_count: u8,
    pub local_data_size: u32,
    pub name: String,
}

#[derive(Clone, Debug)]
pub struct HostFunctionEntry {
    pub name: String,
}

/// A fully decoded (or not-yet-emitted) executable image.
#[derive(Clone, Debug)]
pub struct Executable {
    pub header: MainHeader,
    pub instructions: Vec<InstructionRecord>,
    pub strings: Vec<String>,
    pub functions: Vec<FunctionEntry>,
    pub host_functions: Vec<HostFunctionEntry>,
}

fn read_operand<R: Read>(reader: &mut R) -> Result<Operand, ImageError> {
    let tag = reader.read_u8()?;
    Ok(match tag {
        0 => Operand::Null,
        1 => Operand::Integer(reader.read_i32::<Endian>()?),
        2 => Operand::Float(reader.read_f32::<Endian>()?),
        3 => Operand::IndexString(reader.read_i32::<Endian>()?),
        4 => {
            // Inline-string operands are never written by this
            // assembler (string literals always go through the
            // string table, per §4.3), but the tag is recognized on
            // read for forward compatibility with other producers.
            let len = reader.read_u32::<Endian>()? as usize;
            let mut discarded = vec![0u8; len];
            reader.read_exact(&mut discarded)?;
            Operand::IndexString(-1)
        }
        5 => Operand::IndexStackAbsolute(reader.read_i32::<Endian>()?),
        6 => {
            let base = reader.read_i32::<Endian>()?;
            let offset = reader.read_i32::<Endian>()?;
            Operand::IndexStackRelative(base, offset)
        }
        7 => Operand::IndexInstruction(reader.read_i32::<Endian>()?),
        8 => Operand::IndexFunction(reader.read_i32::<Endian>()?),
        9 => Operand::IndexFunctionHost(reader.read_i32::<Endian>()?),
        10 => Operand::Register(reader.read_u8()?),
        11 => Operand::StackBaseMarker,
        _ => return Err(ImageError::BadSignature),
    })
}

fn write_operand<W: Write>(writer: &mut W, operand: &Operand) -> Result<(), ImageError> {
    writer.write_u8(operand.type_tag())?;
    match operand {
        Operand::Null | Operand::StackBaseMarker => {}
        Operand::Integer(v)
        | Operand::IndexString(v)
        | Operand::IndexStackAbsolute(v)
        | Operand::IndexInstruction(v)
        | Operand::IndexFunction(v)
        | Operand::IndexFunctionHost(v) => writer.write_i32::<Endian>(*v)?,
        Operand::Float(v) => writer.write_f32::<Endian>(*v)?,
        Operand::IndexStackRelative(base, offset) => {
            writer.write_i32::<Endian>(*base)?;
            writer.write_i32::<Endian>(*offset)?;
        }
        Operand::Register(r) => writer.write_u8(*r)?,
    }
    Ok(())
}

fn read_name<R: Read>(reader: &mut R, max_len: usize) -> Result<String, ImageError> {
    let len = reader.read_u8()? as usize;
    let mut bytes = vec![0u8; len.min(max_len)];
    reader.read_exact(&mut bytes)?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

fn write_name<W: Write>(writer: &mut W, name: &str) -> Result<(), ImageError> {
    if name.len() >= 256 {
        return Err(ImageError::NameTooLong);
    }
    writer.write_u8(name.len() as u8)?;
    writer.write_all(name.as_bytes())?;
    Ok(())
}

pub fn read<R: Read>(reader: &mut R) -> Result<Executable, ImageError> {
    let mut signature = [0u8; 8];
    reader.read_exact(&mut signature)?;
    if signature != SIGNATURE {
        return Err(ImageError::BadSignature);
    }

    let available_agni_version = (reader.read_u8()?, reader.read_u8()?);
    let required_agni_version = (reader.read_u8()?, reader.read_u8()?);
    let host_string_index = reader.read_u32::<Endian>()?;
    let host_version = (reader.read_u8()?, reader.read_u8()?);
    let checksum = reader.read_u32::<Endian>()?;
    let stack_size = reader.read_u32::<Endian>()?;
    let global_data_size = reader.read_u32::<Endian>()?;
    let main_index = reader.read_u32::<Endian>()?;
    let thread_priority_type = reader.read_u8()?;
    let thread_priority_user_ms = reader.read_u32::<Endian>()?;

    let header = MainHeader {
        available_agni_version,
        required_agni_version,
        host_string_index,
        host_version,
        checksum,
        stack_size,
        global_data_size,
        main_index,
        thread_priority_type,
        thread_priority_user_ms,
    };

    let instruction_count = reader.read_u32::<Endian>()?;
    let mut instructions = Vec::with_capacity(instruction_count as usize);
    for _ in 0..instruction_count {
        let opcode = reader.read_u16::<Endian>()?;
        let operand_count = reader.read_u8()?;
        let mut operands = Vec::with_capacity(operand_count as usize);
        for _ in 0..operand_count {
            operands.push(read_operand(reader)?);
        }
        instructions.push(InstructionRecord { opcode, operands });
    }

    let string_count = reader.read_u32::<Endian>()?;
    let mut strings = Vec::with_capacity(string_count as usize);
    for _ in 0..string_count {
        let len = reader.read_u32::<Endian>()? as usize;
        let mut bytes = vec![0u8; len];
        reader.read_exact(&mut bytes)?;
        strings.push(String::from_utf8_lossy(&bytes).into_owned());
    }

    let function_count = reader.read_u32::<Endian>()?;
    let mut functions = Vec::with_capacity(function_count as usize);
    for _ in 0..function_count {
        let entry_point = reader.read_u32::<Endian>()?;
        let parameter_count = reader.read_u8()?;
        let local_data_size = reader.read_u32::<Endian>()?;
        let name = read_name(reader, 255)?;
        functions.push(FunctionEntry {
            entry_point,
            parameter_count,
            local_data_size,
            name,
        });
    }

    let host_function_count = reader.read_u32::<Endian>()?;
    let mut host_functions = Vec::with_capacity(host_function_count as usize);
    for _ in 0..host_function_count {
        let name = read_name(reader, 255)?;
        host_functions.push(HostFunctionEntry { name });
    }

    Ok(Executable {
        header,
        instructions,
        strings,
        functions,
        host_functions,
    })
}

/// Writes `executable` to `writer` with its header's checksum field
/// already computed and patched in — see
/// [`crate::checksum::compute`] and the assembler's emission pass,
/// which is responsible for computing it before calling this.
pub fn write<W: Write>(writer: &mut W, executable: &Executable) -> Result<(), ImageError> {
    writer.write_all(&SIGNATURE)?;
    writer.write_u8(executable.header.available_agni_version.0)?;
    writer.write_u8(executable.header.available_agni_version.1)?;
    writer.write_u8(executable.header.required_agni_version.0)?;
    writer.write_u8(executable.header.required_agni_version.1)?;
    writer.write_u32::<Endian>(executable.header.host_string_index)?;
    writer.write_u8(executable.header.host_version.0)?;
    writer.write_u8(executable.header.host_version.1)?;
    writer.write_u32::<Endian>(executable.header.checksum)?;
    writer.write_u32::<Endian>(executable.header.stack_size)?;
    writer.write_u32::<Endian>(executable.header.global_data_size)?;
    writer.write_u32::<Endian>(executable.header.main_index)?;
    writer.write_u8(executable.header.thread_priority_type)?;
    writer.write_u32::<Endian>(executable.header.thread_priority_user_ms)?;

    writer.write_u32::<Endian>(executable.instructions.len() as u32)?;
    for instruction in &executable.instructions {
        writer.write_u16::<Endian>(instruction.opcode)?;
        writer.write_u8(instruction.operands.len() as u8)?;
        for operand in &instruction.operands {
            write_operand(writer, operand)?;
        }
    }

    writer.write_u32::<Endian>(executable.strings.len() as u32)?;
    for string in &executable.strings {
        writer.write_u32::<Endian>(string.len() as u32)?;
        writer.write_all(string.as_bytes())?;
    }

    writer.write_u32::<Endian>(executable.functions.len() as u32)?;
    for function in &executable.functions {
        writer.write_u32::<Endian>(function.entry_point)?;
        writer.write_u8(function.parameter_count)?;
        writer.write_u32::<Endian>(function.local_data_size)?;
        write_name(writer, &function.name)?;
    }

    writer.write_u32::<Endian>(executable.host_functions.len() as u32)?;
    for host_function in &executable.host_functions {
        write_name(writer, &host_function.name)?;
    }

    Ok(())
}

/// Serializes `executable` to an in-memory buffer with the checksum
/// field zeroed, for feeding to [`crate::checksum::compute`].
pub fn to_bytes_with_checksum_zeroed(executable: &Executable) -> Result<Vec<u8>, ImageError> {
    let mut zeroed = executable.clone();
    zeroed.header.checksum = 0;
    let mut buffer = Vec::new();
    write(&mut buffer, &zeroed)?;
    Ok(buffer)
}

pub trait ReadAgniExt: Read + Sized {
    fn read_agni(&mut self) -> Result<Executable, ImageError> {
        read(self)
    }
}

impl<R: Read + Sized> ReadAgniExt for R {}

pub trait WriteAgniExt: Write + Sized {
    fn write_agni(&mut self, executable: &Executable) -> Result<(), ImageError> {
        write(self, executable)
    }
}

impl<W: Write + Sized> WriteAgniExt for W {}

pub fn read_file<P: AsRef<Path>>(path: P) -> Result<Executable, ImageError> {
    BufReader::new(File::open(path)?).read_agni()
}

pub fn write_file<P: AsRef<Path>>(path: P, executable: &Executable) -> Result<(), ImageError> {
    BufWriter::new(File::create(path)?).write_agni(executable)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Executable {
        Executable {
            header: MainHeader {
                available_agni_version: (0, 94),
                required_agni_version: (0, 94),
                host_string_index: NONE_INDEX,
                host_version: (0, 0),
                checksum: 0,
                stack_size: NONE_INDEX,
                global_data_size: 0,
                main_index: 0,
                thread_priority_type: 1,
                thread_priority_user_ms: 0,
            },
            instructions: vec![InstructionRecord {
                opcode: 34,
                operands: vec![],
            }],
            strings: vec!["hi".to_string()],
            functions: vec![FunctionEntry {
                entry_point: 0,
                parameter_count: 0,
                local_data_size: 0,
                name: "Main".to_string(),
            }],
            host_functions: vec![],
        }
    }

    #[test]
    fn round_trips_through_bytes() {
        let executable = sample();
        let mut buffer = Vec::new();
        write(&mut buffer, &executable).unwrap();
        let decoded = read(&mut &buffer[..]).unwrap();
        assert_eq!(decoded.header.main_index, executable.header.main_index);
        assert_eq!(decoded.instructions.len(), 1);
        assert_eq!(decoded.strings, vec!["hi".to_string()]);
        assert_eq!(decoded.functions[0].name, "Main");
    }

    #[test]
    fn rejects_bad_signature() {
        let mut buffer = vec![0u8; 8];
        assert!(matches!(read(&mut &buffer[..]), Err(ImageError::BadSignature)));
        buffer[0] = SIGNATURE[0];
        assert!(matches!(read(&mut &buffer[..]), Err(ImageError::BadSignature)));
    }

    #[test]
    fn checksum_over_zeroed_image_is_stable() {
        let executable = sample();
        let bytes = to_bytes_with_checksum_zeroed(&executable).unwrap();
        let first = checksum::compute(&bytes);
        let second = checksum::compute(&bytes);
        assert_eq!(first, second);
    }
}
