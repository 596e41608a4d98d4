//! Reader for the zip + pickle container written by Python's `torch.save`.
//!
//! The archive holds `<prefix>/data.pkl`, a protocol 2 pickle whose tensors point
//! at raw little-endian storages stored as `<prefix>/data/<key>`. Only the pickle
//! opcodes and globals that `torch.save` emits for tensors and (ordered) dicts of
//! tensors are understood; anything else is reported as an error.

use std::collections::HashMap;
use std::convert::TryFrom;
use std::fs::File;
use std::io::{BufReader, Cursor, Read};
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, LittleEndian, ReadBytesExt};
use tch::{Kind, Tensor};
use zip::ZipArchive;

use crate::{Error, Result};

const PICKLE_ENTRY: &str = "data.pkl";
// Present in TorchScript archives, which libtorch reads itself.
const TORCHSCRIPT_ENTRY: &str = "constants.pkl";
/// Name given to a tensor pickled on its own rather than inside a dict.
pub const SINGLE_ENTRY: &str = "0";

type Parse<T> = std::result::Result<T, String>;

#[derive(Debug, Clone, PartialEq)]
struct StorageRef {
    key: String,
    kind: Kind,
    numel: i64,
}

#[derive(Debug, Clone, PartialEq)]
struct TensorRef {
    storage: StorageRef,
    offset: i64,
    size: Vec<i64>,
    stride: Vec<i64>,
}

#[derive(Debug, Clone, PartialEq)]
enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Tuple(Vec<Value>),
    List(Vec<Value>),
    Dict(Vec<(Value, Value)>),
    Global(String, String),
    Storage(StorageRef),
    Tensor(TensorRef),
    Object(Box<Value>, Box<Value>),
}

impl Value {
    fn into_int(self) -> Parse<i64> {
        match self {
            Value::Int(i) => Ok(i),
            other => Err(format!("expected an integer, got {:?}", other)),
        }
    }

    fn into_ints(self) -> Parse<Vec<i64>> {
        match self {
            Value::Tuple(items) | Value::List(items) => {
                items.into_iter().map(Value::into_int).collect()
            }
            other => Err(format!("expected a tuple of integers, got {:?}", other)),
        }
    }
}

fn storage_kind(name: &str) -> Parse<Kind> {
    let kind = match name {
        "DoubleStorage" => Kind::Double,
        "FloatStorage" => Kind::Float,
        "HalfStorage" => Kind::Half,
        "BFloat16Storage" => Kind::BFloat16,
        "LongStorage" => Kind::Int64,
        "IntStorage" => Kind::Int,
        "ShortStorage" => Kind::Int16,
        "CharStorage" => Kind::Int8,
        "ByteStorage" => Kind::Uint8,
        "BoolStorage" => Kind::Bool,
        other => return Err(format!("unsupported storage type {}", other)),
    };
    Ok(kind)
}

fn truncated(_: std::io::Error) -> String {
    "truncated pickle".to_string()
}

/// Pickle virtual machine restricted to what `torch.save` produces.
///
/// The memo stores snapshots, so a container mutated after being memoized is
/// seen in its memoized state by later gets. `torch.save` only re-reads
/// storages, globals and strings.
#[derive(Default)]
struct Machine {
    stack: Vec<Value>,
    marks: Vec<usize>,
    memo: HashMap<u32, Value>,
}

impl Machine {
    fn pop(&mut self) -> Parse<Value> {
        self.stack
            .pop()
            .ok_or_else(|| "pickle stack underflow".to_string())
    }

    fn top(&mut self) -> Parse<&mut Value> {
        self.stack
            .last_mut()
            .ok_or_else(|| "pickle stack underflow".to_string())
    }

    fn pop_mark(&mut self) -> Parse<Vec<Value>> {
        let mark = self
            .marks
            .pop()
            .ok_or_else(|| "pickle mark underflow".to_string())?;
        if mark > self.stack.len() {
            return Err("pickle mark past end of stack".to_string());
        }
        Ok(self.stack.split_off(mark))
    }

    fn pop_str(&mut self) -> Parse<String> {
        match self.pop()? {
            Value::Str(s) => Ok(s),
            other => Err(format!("expected a string, got {:?}", other)),
        }
    }

    fn memoize(&mut self, index: u32) -> Parse<()> {
        let value = self.top()?.clone();
        self.memo.insert(index, value);
        Ok(())
    }

    fn recall(&mut self, index: u32) -> Parse<()> {
        let value = self
            .memo
            .get(&index)
            .cloned()
            .ok_or_else(|| format!("pickle memo {} is unset", index))?;
        self.stack.push(value);
        Ok(())
    }

    fn append(&mut self, items: Vec<Value>) -> Parse<()> {
        match self.top()? {
            Value::List(list) => {
                list.extend(items);
                Ok(())
            }
            other => Err(format!("cannot append to {:?}", other)),
        }
    }

    fn set_items(&mut self, items: Vec<Value>) -> Parse<()> {
        if items.len() % 2 != 0 {
            return Err("odd number of dict items".to_string());
        }
        let dict = match self.top()? {
            Value::Dict(dict) => dict,
            other => return Err(format!("cannot set items on {:?}", other)),
        };
        let mut items = items.into_iter();
        while let (Some(key), Some(value)) = (items.next(), items.next()) {
            dict.push((key, value));
        }
        Ok(())
    }

    fn persistent_load(&mut self, pid: Value) -> Parse<Value> {
        let mut fields = match pid {
            Value::Tuple(fields) if fields.len() >= 5 => fields.into_iter(),
            other => return Err(format!("unsupported persistent id {:?}", other)),
        };
        let tag = fields.next();
        let storage_type = fields.next();
        let key = fields.next();
        let _location = fields.next();
        let numel = fields.next();

        match (tag, storage_type, key, numel) {
            (
                Some(Value::Str(tag)),
                Some(Value::Global(_, type_name)),
                Some(Value::Str(key)),
                Some(Value::Int(numel)),
            ) if tag == "storage" => Ok(Value::Storage(StorageRef {
                key,
                kind: storage_kind(&type_name)?,
                numel,
            })),
            _ => Err("malformed storage persistent id".to_string()),
        }
    }

    fn reduce(&mut self, callable: Value, args: Value) -> Parse<Value> {
        let (module, name) = match &callable {
            Value::Global(module, name) => (module.clone(), name.clone()),
            _ => return Ok(Value::Object(Box::new(callable), Box::new(args))),
        };

        match (module.as_str(), name.as_str()) {
            ("torch._utils", "_rebuild_tensor_v2") | ("torch._utils", "_rebuild_tensor") => {
                let mut args = match args {
                    Value::Tuple(args) if args.len() >= 4 => args.into_iter(),
                    other => return Err(format!("bad tensor arguments {:?}", other)),
                };
                let storage = match args.next() {
                    Some(Value::Storage(storage)) => storage,
                    other => return Err(format!("expected a storage, got {:?}", other)),
                };
                let offset = args.next().map_or(Ok(0), Value::into_int)?;
                let size = args.next().map_or(Ok(vec![]), Value::into_ints)?;
                let stride = args.next().map_or(Ok(vec![]), Value::into_ints)?;
                if size.len() != stride.len() {
                    return Err(format!("size {:?} and stride {:?} differ", size, stride));
                }
                Ok(Value::Tensor(TensorRef {
                    storage,
                    offset,
                    size,
                    stride,
                }))
            }
            ("torch._utils", "_rebuild_parameter") => match args {
                Value::Tuple(args) => match args.into_iter().next() {
                    Some(tensor @ Value::Tensor(_)) => Ok(tensor),
                    other => Err(format!("expected a tensor parameter, got {:?}", other)),
                },
                other => Err(format!("bad parameter arguments {:?}", other)),
            },
            ("collections", "OrderedDict") | ("builtins", "dict") | ("__builtin__", "dict") => {
                Ok(Value::Dict(vec![]))
            }
            _ => Ok(Value::Object(Box::new(callable), Box::new(args))),
        }
    }

    fn run(mut self, data: &[u8]) -> Parse<Value> {
        let mut cur = Cursor::new(data);

        loop {
            let op = cur.read_u8().map_err(truncated)?;
            match op {
                // PROTO, FRAME
                0x80 => {
                    cur.read_u8().map_err(truncated)?;
                }
                0x95 => {
                    cur.read_u64::<LittleEndian>().map_err(truncated)?;
                }
                b'.' => return self.pop(),
                b'(' => self.marks.push(self.stack.len()),
                b'0' => {
                    self.pop()?;
                }
                b'1' => {
                    self.pop_mark()?;
                }
                b'2' => {
                    let value = self.top()?.clone();
                    self.stack.push(value);
                }

                b'N' => self.stack.push(Value::None),
                0x88 => self.stack.push(Value::Bool(true)),
                0x89 => self.stack.push(Value::Bool(false)),
                b'K' => {
                    let i = cur.read_u8().map_err(truncated)?;
                    self.stack.push(Value::Int(i as i64));
                }
                b'M' => {
                    let i = cur.read_u16::<LittleEndian>().map_err(truncated)?;
                    self.stack.push(Value::Int(i as i64));
                }
                b'J' => {
                    let i = cur.read_i32::<LittleEndian>().map_err(truncated)?;
                    self.stack.push(Value::Int(i as i64));
                }
                // LONG1
                0x8a => {
                    let n = cur.read_u8().map_err(truncated)? as usize;
                    if n > 8 {
                        return Err(format!("{}-byte integer does not fit i64", n));
                    }
                    let i = if n == 0 {
                        0
                    } else {
                        cur.read_int::<LittleEndian>(n).map_err(truncated)?
                    };
                    self.stack.push(Value::Int(i));
                }
                b'G' => {
                    let f = cur.read_f64::<BigEndian>().map_err(truncated)?;
                    self.stack.push(Value::Float(f));
                }

                b'X' => {
                    let len = cur.read_u32::<LittleEndian>().map_err(truncated)? as u64;
                    let s = read_str(&mut cur, len)?;
                    self.stack.push(Value::Str(s));
                }
                0x8c | b'U' => {
                    let len = cur.read_u8().map_err(truncated)? as u64;
                    let s = read_str(&mut cur, len)?;
                    self.stack.push(Value::Str(s));
                }
                0x8d => {
                    let len = cur.read_u64::<LittleEndian>().map_err(truncated)?;
                    let s = read_str(&mut cur, len)?;
                    self.stack.push(Value::Str(s));
                }
                b'T' => {
                    let len = cur.read_u32::<LittleEndian>().map_err(truncated)? as u64;
                    let s = read_str(&mut cur, len)?;
                    self.stack.push(Value::Str(s));
                }

                b'c' => {
                    let module = read_line(&mut cur)?;
                    let name = read_line(&mut cur)?;
                    self.stack.push(Value::Global(module, name));
                }
                // STACK_GLOBAL
                0x93 => {
                    let name = self.pop_str()?;
                    let module = self.pop_str()?;
                    self.stack.push(Value::Global(module, name));
                }

                b')' => self.stack.push(Value::Tuple(vec![])),
                0x85 | 0x86 | 0x87 => {
                    let n = (op - 0x84) as usize;
                    if n > self.stack.len() {
                        return Err("pickle stack underflow".to_string());
                    }
                    let items = self.stack.split_off(self.stack.len() - n);
                    self.stack.push(Value::Tuple(items));
                }
                b't' => {
                    let items = self.pop_mark()?;
                    self.stack.push(Value::Tuple(items));
                }
                b']' => self.stack.push(Value::List(vec![])),
                b'l' => {
                    let items = self.pop_mark()?;
                    self.stack.push(Value::List(items));
                }
                b'a' => {
                    let item = self.pop()?;
                    self.append(vec![item])?;
                }
                b'e' => {
                    let items = self.pop_mark()?;
                    self.append(items)?;
                }
                b'}' => self.stack.push(Value::Dict(vec![])),
                b'd' => {
                    let items = self.pop_mark()?;
                    self.stack.push(Value::Dict(vec![]));
                    self.set_items(items)?;
                }
                b's' => {
                    let value = self.pop()?;
                    let key = self.pop()?;
                    self.set_items(vec![key, value])?;
                }
                b'u' => {
                    let items = self.pop_mark()?;
                    self.set_items(items)?;
                }

                b'q' => {
                    let index = cur.read_u8().map_err(truncated)? as u32;
                    self.memoize(index)?;
                }
                b'r' => {
                    let index = cur.read_u32::<LittleEndian>().map_err(truncated)?;
                    self.memoize(index)?;
                }
                // MEMOIZE
                0x94 => {
                    let index = self.memo.len() as u32;
                    self.memoize(index)?;
                }
                b'h' => {
                    let index = cur.read_u8().map_err(truncated)? as u32;
                    self.recall(index)?;
                }
                b'j' => {
                    let index = cur.read_u32::<LittleEndian>().map_err(truncated)?;
                    self.recall(index)?;
                }

                b'Q' => {
                    let pid = self.pop()?;
                    let storage = self.persistent_load(pid)?;
                    self.stack.push(storage);
                }
                b'R' => {
                    let args = self.pop()?;
                    let callable = self.pop()?;
                    let value = self.reduce(callable, args)?;
                    self.stack.push(value);
                }
                // NEWOBJ
                0x81 => {
                    let args = self.pop()?;
                    let class = self.pop()?;
                    self.stack
                        .push(Value::Object(Box::new(class), Box::new(args)));
                }
                // BUILD: object state (e.g. a state dict's `_metadata`) is not needed.
                b'b' => {
                    self.pop()?;
                }

                other => return Err(format!("unsupported pickle opcode 0x{:02x}", other)),
            }
        }
    }
}

fn read_str(cur: &mut Cursor<&[u8]>, len: u64) -> Parse<String> {
    let remaining = cur.get_ref().len() as u64 - cur.position();
    if len > remaining {
        return Err("truncated pickle".to_string());
    }
    let mut buf = vec![0u8; len as usize];
    cur.read_exact(&mut buf).map_err(truncated)?;
    String::from_utf8(buf).map_err(|e| e.to_string())
}

fn read_line(cur: &mut Cursor<&[u8]>) -> Parse<String> {
    let mut bytes = Vec::new();
    loop {
        match cur.read_u8().map_err(truncated)? {
            b'\n' => break,
            b => bytes.push(b),
        }
    }
    String::from_utf8(bytes).map_err(|e| e.to_string())
}

fn read_entry<R: Read + std::io::Seek>(zip: &mut ZipArchive<R>, name: &str) -> Result<Vec<u8>> {
    let mut file = zip.by_name(name)?;
    let mut data = Vec::new();
    file.read_to_end(&mut data)
        .map_err(|e| Error::Zip(e.into()))?;
    Ok(data)
}

fn materialize(storage_bytes: &[u8], tensor: &TensorRef) -> Parse<Tensor> {
    let storage = &tensor.storage;
    let needed = usize::try_from(storage.numel)
        .ok()
        .and_then(|numel| numel.checked_mul(storage.kind.elt_size_in_bytes()))
        .ok_or_else(|| format!("storage {} has {} elements", storage.key, storage.numel))?;
    if storage_bytes.len() < needed {
        return Err(format!(
            "storage {} holds {} bytes, {} expected",
            storage.key,
            storage_bytes.len(),
            needed
        ));
    }

    let empty = tensor.size.iter().any(|&s| s == 0);
    if !empty {
        if tensor.offset < 0 || tensor.size.iter().chain(&tensor.stride).any(|&v| v < 0) {
            return Err("negative offset, size or stride".to_string());
        }
        let last = tensor
            .size
            .iter()
            .zip(&tensor.stride)
            .fold(tensor.offset, |acc, (size, stride)| acc + (size - 1) * stride);
        if last >= storage.numel {
            return Err(format!(
                "tensor reaches element {} of a {}-element storage",
                last, storage.numel
            ));
        }
    }

    let flat = Tensor::f_of_data_size(&storage_bytes[..needed], &[storage.numel], storage.kind)
        .map_err(|e| e.to_string())?;
    flat.f_as_strided(&tensor.size, &tensor.stride, tensor.offset)
        .and_then(|t| t.f_contiguous())
        .map_err(|e| e.to_string())
}

/// Reads the tensors of a `torch.save` archive.
///
/// Returns `Ok(None)` when `path` is not such an archive (not a zip, no
/// `data.pkl`, or a TorchScript archive), so the caller can try libtorch.
pub fn read_tensors(path: &Path) -> Result<Option<Vec<(String, Tensor)>>> {
    let file = File::open(path).map_err(|e| Error::io(path, e))?;
    let mut zip = match ZipArchive::new(BufReader::new(file)) {
        Ok(zip) => zip,
        Err(_) => return Ok(None),
    };

    let names = zip.file_names().map(str::to_owned).collect::<Vec<_>>();
    let prefix = match names.iter().find_map(|name| {
        name.strip_suffix(PICKLE_ENTRY)
            .filter(|prefix| prefix.is_empty() || prefix.ends_with('/'))
    }) {
        Some(prefix) => prefix.to_owned(),
        None => return Ok(None),
    };
    if names.contains(&format!("{}{}", prefix, TORCHSCRIPT_ENTRY)) {
        log::debug!("{:?} is a TorchScript archive", path);
        return Ok(None);
    }

    let pickle_error = |reason: String| Error::Pickle {
        path: PathBuf::from(path),
        reason,
    };

    let byteorder_entry = format!("{}byteorder", prefix);
    if names.contains(&byteorder_entry) {
        let order = read_entry(&mut zip, &byteorder_entry)?;
        if order.as_slice() != b"little" {
            return Err(pickle_error(format!(
                "unsupported storage byte order {:?}",
                String::from_utf8_lossy(&order)
            )));
        }
    }

    let pickle = read_entry(&mut zip, &format!("{}{}", prefix, PICKLE_ENTRY))?;
    let root = Machine::default().run(&pickle).map_err(pickle_error)?;

    let refs = match root {
        Value::Tensor(tensor) => vec![(SINGLE_ENTRY.to_string(), tensor)],
        Value::Dict(items) => items
            .into_iter()
            .filter_map(|(key, value)| match (key, value) {
                (Value::Str(key), Value::Tensor(tensor)) => Some((key, tensor)),
                _ => None,
            })
            .collect(),
        other => {
            return Err(pickle_error(format!(
                "top-level object is neither a tensor nor a dict: {:?}",
                other
            )))
        }
    };

    let mut storages: HashMap<String, Vec<u8>> = HashMap::new();
    let mut tensors = Vec::with_capacity(refs.len());
    for (name, tensor) in refs {
        let key = &tensor.storage.key;
        if !storages.contains_key(key) {
            let data = read_entry(&mut zip, &format!("{}data/{}", prefix, key))?;
            storages.insert(key.clone(), data);
        }
        let materialized = materialize(&storages[key], &tensor).map_err(pickle_error)?;
        log::debug!("Pickled tensor {:?} with shape {:?}", name, tensor.size);
        tensors.push((name, materialized));
    }

    Ok(Some(tensors))
}
